//! Diagnostic reporting for the lowering backend.
//!
//! Lowering runs deep inside the JIT, so diagnostics here are terse,
//! structured records rather than source-anchored compiler errors: a
//! message, an optional note, and the instruction being lowered when one
//! is known. Emission goes to stderr with ANSI coloring and can be
//! suppressed in tests through an RAII guard.
//!
//! A `Diagnostic` signals a broken invariant in the caller-supplied PIR or
//! in the backend itself. Recoverable "this opcode is not supported
//! natively" cases never produce one; they clear the lowering's success
//! flag instead and the caller falls back to the interpreter.

use std::sync::atomic::{AtomicBool, Ordering};

use fern_pir::InstrId;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub note: Option<String>,
    /// The instruction being lowered when the failure was detected.
    pub at: Option<InstrId>,
}

pub type DiagnosticResult<T> = Result<T, Box<Diagnostic>>;

impl Diagnostic {
    pub fn new(msg: impl Into<String>) -> Box<Self> {
        Box::new(Diagnostic {
            message: msg.into(),
            note: None,
            at: None,
        })
    }

    pub fn with_note(msg: impl Into<String>, note: impl Into<String>) -> Box<Self> {
        Box::new(Diagnostic {
            message: msg.into(),
            note: Some(note.into()),
            at: None,
        })
    }

    pub fn at_instr(msg: impl Into<String>, at: InstrId) -> Box<Self> {
        Box::new(Diagnostic {
            message: msg.into(),
            note: None,
            at: Some(at),
        })
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(at) = self.at {
            write!(f, " (at %{})", at.0)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Print a diagnostic to stderr unless suppressed.
pub fn emit(d: &Diagnostic) {
    if !DIAGNOSTICS_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let red = "\x1b[31m";
    let blue = "\x1b[34m";
    let reset = "\x1b[0m";
    eprintln!("{}error{}: {}", red, reset, d);
    if let Some(note) = &d.note {
        eprintln!("{}note{}: {}", blue, reset, note);
    }
}

/// Temporarily silence diagnostic output; state restores on drop.
pub fn suppress() -> SuppressGuard {
    let prev = DIAGNOSTICS_ENABLED.swap(false, Ordering::SeqCst);
    SuppressGuard { prev }
}

pub struct SuppressGuard {
    prev: bool,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        DIAGNOSTICS_ENABLED.store(self.prev, Ordering::SeqCst);
    }
}
