//! Argument vector configuration.

use serde::Deserialize;

/// Arguments passed to an app's script, given either as a single
/// whitespace-separated line or as an explicit list (the latter being
/// the only way to pass an argument that contains whitespace).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "LineOrVectorArgs")]
pub struct ArgsConfig(pub Vec<String>);

#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(untagged)]
enum LineOrVectorArgs {
    ArgsLine(String),

    ArgsVector(Vec<String>),
}

impl From<LineOrVectorArgs> for ArgsConfig {
    fn from(config: LineOrVectorArgs) -> Self {
        match config {
            LineOrVectorArgs::ArgsLine(line) => {
                Self(line.split_whitespace().map(|s| s.to_owned()).collect())
            }
            LineOrVectorArgs::ArgsVector(v) => Self(v),
        }
    }
}
