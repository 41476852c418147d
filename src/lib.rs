pub mod config;
pub mod dns;
pub mod filter;
pub mod id;
pub mod mail;
pub mod outcome;
pub mod queue;
pub mod rules;
pub mod scanner;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::{Action, Config, Criteria, FilterRule};
pub use filter::{Filter, Pipeline, Stage};
pub use mail::{Destination, Mail};
pub use outcome::{Halt, Outcome, OutcomeKind};
pub use session::Session;
pub use supervisor::Supervisor;
