//! SSA slot allocation for boxed values.
//!
//! Boxed values live in GC-scanned frame slots; the allocator packs them
//! so that values with disjoint live ranges share a slot. Two exceptions
//! widen interference beyond range overlap:
//!
//! - any value carrying a type-feedback origin interferes with everything,
//!   so its slot stays private and the runtime profiler can find it;
//! - `verify()` re-checks the whole assignment pairwise and is cheap
//!   enough to run on every compile.
//!
//! Unboxed values never get a slot here; the variable manager gives them
//! allocas or keeps them as plain SSA values.

use std::collections::HashMap;

use fern_pir::analysis::Liveness;
use fern_pir::{Code, InstrId, Op, Value};

use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::{rep_of_type, Rep};

pub struct Allocation {
    slots: HashMap<InstrId, usize>,
    num_slots: usize,
}

impl Allocation {
    pub fn slot_of(&self, v: InstrId) -> Option<usize> {
        self.slots.get(&v).copied()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }
}

/// Does `v` need any storage binding at all? Constant loads (and casts of
/// constant loads) re-materialize from the pool instead.
pub fn needs_a_variable(code: &Code, v: InstrId) -> bool {
    let instr = code.instr(v);
    if !instr.op.produces_result() {
        return false;
    }
    match instr.op {
        Op::LdConst(_) => false,
        Op::CastType => !matches!(
            instr.args[0],
            Value::Instr(a) if matches!(code.instr(a).op, Op::LdConst(_))
        ),
        _ => true,
    }
}

/// Does `v` need a boxed frame slot?
pub fn needs_a_slot(code: &Code, v: InstrId) -> bool {
    needs_a_variable(code, v) && rep_of_type(&code.instr(v).ty) == Rep::Boxed
}

fn interfere(code: &Code, liveness: &Liveness, a: InstrId, b: InstrId) -> bool {
    if a != b
        && (code.instr(a).type_feedback.is_some() || code.instr(b).type_feedback.is_some())
    {
        return true;
    }
    liveness.interfere(code, a, b)
}

/// Greedy first-fit coloring over instructions in RPO.
pub fn compute(code: &Code, liveness: &Liveness) -> Allocation {
    let mut slots: HashMap<InstrId, usize> = HashMap::new();
    let mut assigned: Vec<Vec<InstrId>> = Vec::new();

    code.each_instr(|iid, _| {
        if !needs_a_slot(code, iid) || !liveness.count(iid) {
            return;
        }
        let mut chosen = None;
        for (slot, holders) in assigned.iter().enumerate() {
            if holders
                .iter()
                .all(|h| !interfere(code, liveness, *h, iid))
            {
                chosen = Some(slot);
                break;
            }
        }
        let slot = chosen.unwrap_or_else(|| {
            assigned.push(Vec::new());
            assigned.len() - 1
        });
        assigned[slot].push(iid);
        slots.insert(iid, slot);
    });

    Allocation {
        slots,
        num_slots: assigned.len(),
    }
}

/// Assert no two interfering values share a slot.
pub fn verify(code: &Code, liveness: &Liveness, alloc: &Allocation) -> DiagnosticResult<()> {
    let mut by_slot: HashMap<usize, Vec<InstrId>> = HashMap::new();
    for (v, s) in &alloc.slots {
        by_slot.entry(*s).or_default().push(*v);
    }
    for (slot, holders) in &by_slot {
        for (n, a) in holders.iter().enumerate() {
            for b in &holders[n + 1..] {
                if interfere(code, liveness, *a, *b) {
                    return Err(Diagnostic::with_note(
                        format!("allocator assigned slot {} to interfering values", slot),
                        format!("%{} and %{}", a.0, b.0),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_pir::{Const, FeedbackOrigin, Instr, PirType};

    fn boxed_ty() -> PirType {
        PirType::int()
    }

    #[test]
    fn disjoint_ranges_share_a_slot() {
        let mut c = Code::new(0);
        let k = c.pool_push(Const::Int(1));
        let bb = c.entry;
        let a = c.push(bb, Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty()).with_env(Value::GlobalEnv));
        let _use_a = c.push(
            bb,
            Instr::new(Op::XLength, PirType::simple_scalar_int()).with_args(vec![Value::Instr(a)]),
        );
        let b = c.push(bb, Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty()).with_env(Value::GlobalEnv));
        let ret = c.push(
            bb,
            Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(b)]),
        );
        let _ = (k, ret);

        let l = Liveness::compute(&c);
        let alloc = compute(&c, &l);
        assert_eq!(alloc.slot_of(a), alloc.slot_of(b));
        assert_eq!(alloc.num_slots(), 1);
        verify(&c, &l, &alloc).unwrap();
    }

    #[test]
    fn feedback_slots_stay_private() {
        let mut c = Code::new(0);
        let bb = c.entry;
        let fb = FeedbackOrigin {
            code_uid: 0,
            offset: 4,
        };
        let a = c.push(
            bb,
            Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty())
                .with_env(Value::GlobalEnv)
                .with_feedback(fb),
        );
        let _use_a = c.push(
            bb,
            Instr::new(Op::XLength, PirType::simple_scalar_int()).with_args(vec![Value::Instr(a)]),
        );
        let b = c.push(bb, Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty()).with_env(Value::GlobalEnv));
        c.push(
            bb,
            Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(b)]),
        );

        let l = Liveness::compute(&c);
        let alloc = compute(&c, &l);
        // ranges are disjoint, but the feedback-carrying value must not share
        assert_ne!(alloc.slot_of(a), alloc.slot_of(b));
        verify(&c, &l, &alloc).unwrap();
    }

    #[test]
    fn overlapping_ranges_get_distinct_slots() {
        let mut c = Code::new(0);
        let bb = c.entry;
        let a = c.push(bb, Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty()).with_env(Value::GlobalEnv));
        let b = c.push(bb, Instr::new(Op::LdVar(fern_pir::SymId(0)), boxed_ty()).with_env(Value::GlobalEnv));
        let sum = c.push(
            bb,
            Instr::new(Op::Add, boxed_ty())
                .with_args(vec![Value::Instr(a), Value::Instr(b)]),
        );
        c.push(
            bb,
            Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
        );

        let l = Liveness::compute(&c);
        let alloc = compute(&c, &l);
        assert_ne!(alloc.slot_of(a), alloc.slot_of(b));
        verify(&c, &l, &alloc).unwrap();
    }
}
