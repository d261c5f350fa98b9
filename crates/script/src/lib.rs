//! Script-level consensus surface.
//!
//! Opcode execution itself sits behind the [`ScriptChecker`] trait; this
//! crate owns everything validation needs around it: verify-flag
//! composition across the upgrade schedule, sigop counting, and the
//! handful of structural script patterns consensus matches on.

pub mod flags;
pub mod sigops;
pub mod structural;

use std::fmt;

use candyd_primitives::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptError {
    pub reason: &'static str,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ScriptError {}

/// Executes the script pair for one input under a flag set.
///
/// Validation treats execution as a pure predicate; the node wires in a
/// real interpreter, tests use [`AlwaysValid`] or a closure.
pub trait ScriptChecker: Send + Sync {
    fn check(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        value: i64,
        flags: u32,
    ) -> Result<(), ScriptError>;
}

/// Checker that accepts every script. Used by tests and by callers that
/// rely on assume-valid ancestry.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysValid;

impl ScriptChecker for AlwaysValid {
    fn check(
        &self,
        _script_sig: &[u8],
        _script_pubkey: &[u8],
        _tx: &Transaction,
        _input_index: usize,
        _value: i64,
        _flags: u32,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

impl<F> ScriptChecker for F
where
    F: Fn(&[u8], &[u8], &Transaction, usize, i64, u32) -> Result<(), ScriptError> + Send + Sync,
{
    fn check(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        value: i64,
        flags: u32,
    ) -> Result<(), ScriptError> {
        self(script_sig, script_pubkey, tx, input_index, value, flags)
    }
}
