use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    ChronoParse(#[from] chrono::ParseError),
    #[error("Unable to backup due to lock file {lock_file:?} with process id {owner}")]
    LockHeld { lock_file: PathBuf, owner: String },
    #[error("{path:?} exists but cannot be opened for writing")]
    UnwritableTarget { path: PathBuf },
    #[error("{path:?} is not a file")]
    NotAFile { path: PathBuf },
    #[error("{name:?} cannot be used as a backup directory name, try {suggestion:?}")]
    InvalidName { name: String, suggestion: String },
    #[error("Missing configuration value {0:?}, set it with a flag or in the config file")]
    MissingConfig(&'static str),
    #[error("{0}")]
    Engine(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn engine<S: Into<String>>(msg: S) -> Self {
        Self::Engine(msg.into())
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Ordered messages of this error and everything nested in it, outermost first.
    ///
    /// Context wrappers contribute their own message only, so the innermost
    /// cause is not repeated at every level.
    pub fn cause_chain(&self) -> Vec<String> {
        let mut messages = Vec::new();
        self.collect_causes(&mut messages);
        messages
    }

    fn collect_causes(&self, messages: &mut Vec<String>) {
        match self {
            Error::WithMsg { msg, error } => {
                messages.push(msg.clone());
                error.collect_causes(messages);
            }
            Error::WithDebugObjAndFnName {
                error,
                obj_debug,
                fn_name,
            } => {
                messages.push(format!("{:?} {} failed", obj_debug, fn_name));
                error.collect_causes(messages);
            }
            Error::LotsOfError(errors) => errors.iter().for_each(|e| e.collect_causes(messages)),
            e => {
                messages.push(e.to_string());
                let mut source = std::error::Error::source(e);
                while let Some(inner) = source {
                    messages.push(inner.to_string());
                    source = inner.source();
                }
            }
        }
    }
}
