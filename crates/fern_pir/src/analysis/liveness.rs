//! Per-instruction liveness over the SSA CFG.
//!
//! Standard iterative backward dataflow. For every instruction position we
//! record the set of SSA values live *after* it, plus live-at-entry sets
//! per block. Phi inputs count as uses at the end of the predecessor they
//! flow from, not at the phi's own block; a phi itself is live in its own
//! block from entry.

use std::collections::{HashMap, HashSet};

use crate::code::{BlockId, Code};
use crate::instr::{InstrId, Op, Value};

pub struct Liveness {
    live_after: HashMap<InstrId, HashSet<InstrId>>,
    live_at_entry: HashMap<BlockId, HashSet<InstrId>>,
    /// Values used anywhere. A value absent here is dead on arrival and
    /// writes to it may be silently dropped.
    used: HashSet<InstrId>,
}

impl Liveness {
    pub fn compute(code: &Code) -> Liveness {
        let mut used: HashSet<InstrId> = HashSet::new();
        code.each_instr(|_, instr| {
            instr.each_arg(|v| {
                if let Value::Instr(i) = v {
                    used.insert(i);
                }
            });
        });

        let rpo = code.rpo();
        let mut live_in: HashMap<BlockId, HashSet<InstrId>> = HashMap::new();
        let mut live_after: HashMap<InstrId, HashSet<InstrId>> = HashMap::new();

        // per-block phi defs, and per-edge phi uses
        let mut phis_in: HashMap<BlockId, Vec<InstrId>> = HashMap::new();
        let mut phi_uses_from: HashMap<BlockId, HashSet<InstrId>> = HashMap::new();
        for bb in &rpo {
            for iid in &code.block(*bb).instrs {
                if let Op::Phi { inputs } = &code.instr(*iid).op {
                    phis_in.entry(*bb).or_default().push(*iid);
                    for (pred, v) in inputs {
                        if let Value::Instr(i) = v {
                            phi_uses_from.entry(*pred).or_default().insert(*i);
                        }
                    }
                }
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for bb in rpo.iter().rev() {
                // live-out: successors' live-in minus their phis, plus the
                // phi inputs this block contributes
                let mut out: HashSet<InstrId> = HashSet::new();
                for s in code.successors(*bb) {
                    if let Some(li) = live_in.get(&s) {
                        out.extend(li.iter().copied());
                    }
                    if let Some(phis) = phis_in.get(&s) {
                        for p in phis {
                            out.remove(p);
                        }
                    }
                }
                if let Some(uses) = phi_uses_from.get(bb) {
                    out.extend(uses.iter().copied());
                }

                // backward walk through the block
                let mut cur = out;
                for iid in code.block(*bb).instrs.iter().rev() {
                    live_after.insert(*iid, cur.clone());
                    cur.remove(iid);
                    let instr = code.instr(*iid);
                    if !instr.is_phi() {
                        instr.each_arg(|v| {
                            if let Value::Instr(i) = v {
                                cur.insert(i);
                            }
                        });
                    }
                }
                if let Some(phis) = phis_in.get(bb) {
                    cur.extend(phis.iter().copied());
                }

                let entry = live_in.entry(*bb).or_default();
                if *entry != cur {
                    *entry = cur;
                    changed = true;
                }
            }
        }

        Liveness {
            live_after,
            live_at_entry: live_in,
            used,
        }
    }

    /// Is `v` live immediately after `at` executes?
    pub fn live_after(&self, at: InstrId, v: InstrId) -> bool {
        self.live_after
            .get(&at)
            .map(|s| s.contains(&v))
            .unwrap_or(false)
    }

    pub fn live_at_entry(&self, bb: BlockId, v: InstrId) -> bool {
        self.live_at_entry
            .get(&bb)
            .map(|s| s.contains(&v))
            .unwrap_or(false)
    }

    /// Does `v` appear as an operand anywhere at all?
    pub fn count(&self, v: InstrId) -> bool {
        self.used.contains(&v)
    }

    /// Is `v` live right at `a`'s definition point (exclusive of `a`)?
    fn live_at_def(&self, code: &Code, a: InstrId, v: InstrId) -> bool {
        if code.instr(a).is_phi() {
            self.live_at_entry(code.instr(a).owner(), v) || self.live_after(a, v)
        } else {
            self.live_after(a, v)
        }
    }

    /// Do the live ranges of `a` and `b` overlap?
    pub fn interfere(&self, code: &Code, a: InstrId, b: InstrId) -> bool {
        a != b && (self.live_at_def(code, a, b) || self.live_at_def(code, b, a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{Instr, Op, Value};
    use crate::types::PirType;
    use crate::code::Const;

    #[test]
    fn straight_line_ranges() {
        let mut c = Code::new(0);
        let k = c.pool_push(Const::Int(1));
        let bb = c.entry;
        let a = c.push(bb, Instr::new(Op::LdConst(k), PirType::simple_scalar_int()));
        let b = c.push(bb, Instr::new(Op::LdConst(k), PirType::simple_scalar_int()));
        let add = c.push(
            bb,
            Instr::new(Op::Add, PirType::simple_scalar_int())
                .with_args(vec![Value::Instr(a), Value::Instr(b)]),
        );
        let ret = c.push(
            bb,
            Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(add)]),
        );

        let l = Liveness::compute(&c);
        assert!(l.live_after(a, a));
        assert!(l.live_after(b, a));
        assert!(!l.live_after(add, a));
        assert!(l.live_after(add, add));
        assert!(!l.live_after(ret, add));
        assert!(l.interfere(&c, a, b));
        assert!(!l.interfere(&c, a, add));
    }

    #[test]
    fn phi_input_live_at_pred_exit_only() {
        let mut c = Code::new(0);
        let k = c.pool_push(Const::Int(0));
        let entry = c.entry;
        let left = c.add_block();
        let right = c.add_block();
        let join = c.add_block();

        let cond = c.push(entry, Instr::new(Op::LdConst(k), PirType::test()));
        c.push(
            entry,
            Instr::new(Op::Branch, PirType::any()).with_args(vec![Value::Instr(cond)]),
        );
        c.set_cond(entry, left, right);

        let x = c.push(left, Instr::new(Op::LdConst(k), PirType::simple_scalar_int()));
        c.set_jump(left, join);
        let y = c.push(right, Instr::new(Op::LdConst(k), PirType::simple_scalar_int()));
        c.set_jump(right, join);

        let phi = c.push(
            join,
            Instr::new(
                Op::Phi {
                    inputs: vec![(left, Value::Instr(x)), (right, Value::Instr(y))],
                },
                PirType::simple_scalar_int(),
            ),
        );
        c.push(
            join,
            Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(phi)]),
        );

        let l = Liveness::compute(&c);
        // x is live at the end of its own block but not at the join entry
        assert!(l.live_after(x, x));
        assert!(!l.live_at_entry(join, x));
        // the phi is live from its own block entry
        assert!(l.live_at_entry(join, phi));
        // x and y never overlap
        assert!(!l.interfere(&c, x, y));
    }
}
