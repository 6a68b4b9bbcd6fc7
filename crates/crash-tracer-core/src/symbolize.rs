//! Symbol resolution seam.
//!
//! The tracer captures raw instruction addresses at a fatal delivery;
//! turning them into human-readable frames is a backend concern. This
//! module defines the narrow interface the record emitter uses to
//! request resolution and tolerate its absence — a resolver failure
//! never blocks record emission.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One resolved (or unresolved) stack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolizedFrame {
    /// Instruction address.
    pub ip: u64,
    /// Symbol name, when resolution succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Byte offset into the symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Resolution failure. Non-fatal by contract: callers degrade to a
/// record without frames plus a diagnostic note.
#[derive(Debug, Error)]
pub enum SymbolizeError {
    #[error("no symbol backend configured")]
    Unavailable,

    #[error("symbol backend failed: {0}")]
    Backend(String),
}

/// Address-to-frame resolution backend.
pub trait SymbolResolver: Send + Sync {
    /// Resolve instruction addresses observed in `pid` to frames.
    ///
    /// Implementations may return fewer frames than addresses; order
    /// must follow the input.
    fn resolve(&self, pid: u32, addrs: &[u64]) -> Result<Vec<SymbolizedFrame>, SymbolizeError>;
}

/// The no-backend resolver: always reports [`SymbolizeError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _pid: u32, _addrs: &[u64]) -> Result<Vec<SymbolizedFrame>, SymbolizeError> {
        Err(SymbolizeError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_symbols_is_unavailable() {
        let result = NoSymbols.resolve(1, &[0xdead_beef]);
        assert!(matches!(result, Err(SymbolizeError::Unavailable)));
    }
}
