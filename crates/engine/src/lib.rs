#![doc = include_str!("../README.md")]

pub mod cache;
pub mod classifier;
pub mod dispatcher;
pub mod executor;

// --- 주요 타입 re-export ---

pub use cache::{AlertCache, CacheDecision};
pub use classifier::{classify, ThreatClassifier, ThreatClassifierBuilder};
pub use dispatcher::{AlertDispatcher, AlertDispatcherBuilder};
pub use executor::{
    install_default_script, AlertExecutor, ShellAlertExecutor, DEFAULT_SCRIPT_BODY,
};
