//! Command builder for the provider CLI.

use std::path::Path;

/// Builder for `wrangler deploy` invocations.
#[derive(Debug, Clone, Default)]
pub struct WranglerCmdBuilder {
    script: Option<String>,
    name: Option<String>,
    compatibility_date: Option<String>,
    config: Option<String>,
    env: Option<String>,
    vars: Vec<(String, String)>,
    dry_run: bool,
    extra_args: Vec<String>,
}

impl WranglerCmdBuilder {
    /// Create a new deploy command builder.
    pub fn deploy() -> Self {
        Self::default()
    }

    /// Pass an explicit manifest path.
    pub fn config(mut self, path: impl AsRef<Path>) -> Self {
        self.config = Some(path.as_ref().display().to_string());
        self
    }

    /// Deploy `script` directly, for projects without a manifest.
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Worker name, overriding whatever a manifest says.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn compatibility_date(mut self, date: impl Into<String>) -> Self {
        self.compatibility_date = Some(date.into());
        self
    }

    /// Select a manifest environment section.
    pub fn env(mut self, env: Option<impl Into<String>>) -> Self {
        self.env = env.map(Into::into);
        self
    }

    /// Inject a plain-text variable into the worker.
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Add extra arguments.
    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Build the arguments, without the program name.
    pub fn build(self) -> Vec<String> {
        let mut cmd = vec!["deploy".to_string()];

        if let Some(config) = self.config {
            cmd.push("--config".to_string());
            cmd.push(config);
        }

        if let Some(env) = self.env {
            cmd.push("--env".to_string());
            cmd.push(env);
        }

        for (key, value) in self.vars {
            cmd.push("--var".to_string());
            cmd.push(format!("{}:{}", key, value));
        }

        if self.dry_run {
            cmd.push("--dry-run".to_string());
        }

        if let Some(name) = self.name {
            cmd.push("--name".to_string());
            cmd.push(name);
        }

        if let Some(date) = self.compatibility_date {
            cmd.push("--compatibility-date".to_string());
            cmd.push(date);
        }

        if let Some(script) = self.script {
            cmd.push(script);
        }

        cmd.extend(self.extra_args);

        cmd
    }

    pub fn version() -> Vec<String> {
        vec!["--version".to_string()]
    }

    pub fn whoami() -> Vec<String> {
        vec!["whoami".to_string()]
    }

    pub fn d1_list() -> Vec<String> {
        ["d1", "list", "--json"].map(String::from).to_vec()
    }

    pub fn d1_create(name: &str) -> Vec<String> {
        ["d1", "create", name].map(String::from).to_vec()
    }

    pub fn d1_delete(name: &str) -> Vec<String> {
        ["d1", "delete", name, "-y"].map(String::from).to_vec()
    }

    /// The value is read from stdin so it never appears in the process list.
    pub fn secret_put(worker: &str, key: &str) -> Vec<String> {
        ["secret", "put", key, "--name", worker].map(String::from).to_vec()
    }

    pub fn secret_delete(worker: &str, key: &str) -> Vec<String> {
        ["secret", "delete", key, "--name", worker].map(String::from).to_vec()
    }
}
