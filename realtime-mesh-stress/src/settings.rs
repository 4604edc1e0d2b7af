//! Choosing the [`MeshConfig`] from a file and command-line overrides.

use std::path::PathBuf;

use anyhow::Context as _;

use realtime_mesh::MeshConfig;

/// [`clap::Args`] argument group struct for args that affect what configuration is used.
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct SettingsArgs {
    /// JSON file to read the mesh configuration from. Absent fields take their default
    /// values.
    #[arg(long = "config", value_name = "FILE")]
    pub(crate) config_file: Option<PathBuf>,

    #[expect(clippy::doc_markdown, reason = "will be displayed in --help")]
    /// Override the value of a top-level configuration field.
    ///
    /// The value is specified as a key-value pair where the key is an unquoted string, the
    /// separator is “=”, and the value is a JSON value (which, if a string, must be quoted);
    /// for example: -Scontention='"Fail"' or -Scollision='{"mode":"ConvexHull"}'
    #[arg(long = "set", short = 'S', value_parser = parse_configure, value_name = "NAME=JSON")]
    pub(crate) set: Vec<(String, serde_json::Value)>,
}

impl SettingsArgs {
    /// Constructs the [`MeshConfig`] a run with these args should use.
    pub(crate) fn build_config(self) -> Result<MeshConfig, anyhow::Error> {
        let Self {
            config_file,
            set: to_override,
        } = self;

        let base = match &config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                MeshConfig::from_json_str(&text)
                    .with_context(|| format!("{} is not a valid configuration", path.display()))?
            }
            None => MeshConfig::default(),
        };

        if to_override.is_empty() {
            return Ok(base);
        }
        let serde_json::Value::Object(mut fields) = serde_json::to_value(&base)? else {
            anyhow::bail!("configuration did not serialize as a JSON object");
        };
        for (key, value) in to_override {
            fields.insert(key, value);
        }
        serde_json::from_value(serde_json::Value::Object(fields))
            .context("--set did not produce a valid configuration")
    }
}

fn parse_configure(arg: &str) -> Result<(String, serde_json::Value), anyhow::Error> {
    let (key, value) = arg.split_once('=').ok_or_else(|| anyhow::anyhow!("missing '='"))?;
    let value = serde_json::from_str(value)?;
    Ok((key.to_owned(), value))
}
