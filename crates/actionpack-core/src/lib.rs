//! Core library for the action pack system: a signed, replay-resistant
//! remote execution facility for trusted peers on a private overlay
//! network.
//!
//! A sender compiles a small imperative script into a binary pack, signs
//! it with an ECDSA P-256 key, and ships the envelope over TCP. The
//! receiver authenticates the sender, enforces a per-key policy, writes
//! embedded files atomically into a sandbox, and executes each step with
//! captured output, returning a plain-text transcript.
//!
//! Layering, leaves first: [`pack`] and [`codec`] define the unit of work
//! and its wire form; [`script`] authors packs; [`crypto`], [`keystore`],
//! [`policy`], and [`replay`] gate acceptance; [`sandbox`] and [`runner`]
//! perform the two step kinds; [`executor`] ties the pipeline together
//! for the daemon's connection handler.

pub mod codec;
pub mod crypto;
pub mod executor;
pub mod keystore;
pub mod pack;
pub mod paths;
pub mod policy;
pub mod replay;
pub mod runner;
pub mod sandbox;
pub mod script;
pub mod sink;

pub use codec::{decode_envelope, decode_payload, encode_envelope, encode_payload, Envelope};
pub use executor::{ExecutorOptions, PackExecutor};
pub use pack::{ExecStep, Pack, PackId, Step, WriteFileStep};
pub use script::compile_script;
