//! Chain support for KeepKey sends
//!
//! Only UTXO chains are handled here; each script family lives in its own module.

pub mod bitcoin;

pub use self::bitcoin::ScriptType;
