//! statefuzz, a stateful coverage-guided fuzzer for network servers, with an
//! LLM oracle for grammar induction and stall recovery.

pub mod calibration;
pub mod config;
pub mod coverage;
pub mod dictionary;
pub mod forkserver;
pub mod fuzzer;
pub mod grammar;
pub mod ipsm;
pub mod mutation;
pub mod net;
pub mod oracle;
pub mod output;
pub mod protocol;
pub mod queue;

mod bolts;
