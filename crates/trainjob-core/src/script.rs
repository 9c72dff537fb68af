//! Launcher script generation for training functions.
//!
//! A [`TrainFunction`] is opaque source text plus a name and optional JSON
//! arguments. The builder only checks the name and wraps the source into a
//! `bash -c` script that writes it to a file and hands it to the runtime's
//! entrypoint.

use crate::constants;
use crate::error::{Result, TrainerError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

const HEREDOC_DELIMITER: &str = "EOM";

/// A training function captured as source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainFunction {
    /// Name of the function to call.
    pub name: String,
    /// Complete definition of the function, possibly indented.
    pub source: String,
    /// Arguments passed as a single JSON-decoded parameter.
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    /// File the source is written to inside the container.
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_file_name() -> String {
    "train.py".to_string()
}

impl TrainFunction {
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            args: None,
            file_name: default_file_name(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Checks the function can be embedded and called.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(TrainerError::InvalidTrainFunction(format!(
                "'{}' is not a valid function name",
                self.name
            )));
        }
        if self.source.trim().is_empty() {
            return Err(TrainerError::InvalidTrainFunction(format!(
                "function '{}' has no source",
                self.name
            )));
        }
        if self.source.lines().any(|line| line.trim() == HEREDOC_DELIMITER) {
            return Err(TrainerError::InvalidTrainFunction(format!(
                "function '{}' contains a line reserved by the launcher ({HEREDOC_DELIMITER})",
                self.name
            )));
        }
        if self.file_name.is_empty() || self.file_name.contains(['/', '"', '\'']) {
            return Err(TrainerError::InvalidTrainFunction(format!(
                "invalid script file name '{}'",
                self.file_name
            )));
        }
        Ok(())
    }

    /// Dedented source followed by the call line.
    fn program(&self) -> Result<String> {
        let mut program = dedent(&self.source);
        if !program.ends_with('\n') {
            program.push('\n');
        }
        program.push('\n');

        match &self.args {
            None => {
                let _ = writeln!(program, "{}()", self.name);
            }
            Some(args) => {
                let json = serde_json::to_string(args)?;
                if json.contains("'''") {
                    return Err(TrainerError::InvalidTrainFunction(format!(
                        "arguments of '{}' cannot contain triple quotes",
                        self.name
                    )));
                }
                let _ = writeln!(program, "import json");
                let _ = writeln!(program, "{}(json.loads(r'''{json}'''))", self.name);
            }
        }

        Ok(program)
    }
}

/// Builds the `bash -c` argument that installs packages and runs a function.
#[derive(Debug, Clone)]
pub struct LauncherScript<'a> {
    func: &'a TrainFunction,
    entrypoint: &'a str,
    packages: &'a [String],
    pip_index_url: &'a str,
}

impl<'a> LauncherScript<'a> {
    #[must_use]
    pub fn new(func: &'a TrainFunction, entrypoint: &'a str) -> Self {
        Self { func, entrypoint, packages: &[], pip_index_url: constants::DEFAULT_PIP_INDEX_URL }
    }

    #[must_use]
    pub fn with_packages(mut self, packages: &'a [String], pip_index_url: &'a str) -> Self {
        self.packages = packages;
        self.pip_index_url = pip_index_url;
        self
    }

    /// Renders the full script.
    pub fn render(&self) -> Result<String> {
        self.func.validate()?;
        let program = self.func.program()?;

        let mut script = String::new();
        if !self.packages.is_empty() {
            script.push_str(&pip_preamble(self.packages, self.pip_index_url));
        }

        let file = &self.func.file_name;
        let _ = writeln!(script, "program_path=$(mktemp -d)");
        let _ = writeln!(script, "read -r -d '' SCRIPT << '{HEREDOC_DELIMITER}'");
        script.push_str(&program);
        let _ = writeln!(script, "{HEREDOC_DELIMITER}");
        let _ = writeln!(script, "printf \"%s\" \"$SCRIPT\" > \"$program_path/{file}\"");
        let _ = write!(script, "{} \"$program_path/{file}\"", self.entrypoint);

        Ok(script)
    }

    /// Container args: the rendered script as the single argument.
    pub fn args(&self) -> Result<Vec<String>> {
        Ok(vec![self.render()?])
    }
}

fn pip_preamble(packages: &[String], pip_index_url: &str) -> String {
    format!(
        "if ! [ -x \"$(command -v pip)\" ]; then\n    \
         python -m ensurepip || python -m ensurepip --user || apt-get install python-pip\n\
         fi\n\n\
         PIP_DISABLE_PIP_VERSION_CHECK=1 python -m pip install --quiet \\\n    \
         --no-warn-script-location --index-url {pip_index_url} {}\n\n",
        packages.join(" ")
    )
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Removes the whitespace prefix shared by all non-blank lines.
fn dedent(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    source
        .lines()
        .map(|line| {
            if line.trim().is_empty() { "" } else { line.get(indent..).unwrap_or_else(|| line.trim_start()) }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
