//! Sources of Pkl modules to evaluate.

use std::io;
use std::path::Path;

use url::Url;

/// URI used for modules given as inline text.
pub const REPL_TEXT_URI: &str = "repl:text";

/// A module to evaluate: its URI plus, optionally, its text.
///
/// Without contents the evaluator resolves the URI itself, through a client
/// module reader when one is registered for its scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    uri: Url,
    contents: Option<String>,
}

impl ModuleSource {
    pub fn new(uri: Url, contents: Option<String>) -> Self {
        Self { uri, contents }
    }

    /// A file on disk. Relative paths resolve against the working directory.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let uri = Url::from_file_path(&path).map_err(|()| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot build a file URI from {}", path.display()),
            )
        })?;
        Ok(Self::new(uri, None))
    }

    /// Inline module text.
    pub fn text(text: impl Into<String>) -> Self {
        let uri = Url::parse(REPL_TEXT_URI).expect("static URI is valid");
        Self::new(uri, Some(text.into()))
    }

    pub fn uri(uri: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(uri)?, None))
    }

    pub fn module_uri(&self) -> &Url {
        &self.uri
    }

    pub fn contents(&self) -> Option<&str> {
        self.contents.as_deref()
    }
}
