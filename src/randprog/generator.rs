//! Deterministic program synthesis.
//!
//! From a 32-byte seed, emits a straight-line-plus-branch program over the
//! opcode set, shaped by an operation budget. The pseudorandom stream is
//! ChaCha20-expanded seed material consumed in 64-byte windows, and the
//! order in which words are drawn is part of the consensus contract: every
//! draw site below must stay where it is.

use super::opcodes as op;
use super::ProgramError;
use crate::config::gen::{
    if_body_budget, loop_max_cycles, should_branch, should_loop, BRANCH_COST,
    HIGHER_SCOPE_LIKELIHOOD, IMMEDIATE_LIKELIHOOD, INITIAL_BUDGET, INPUT_COST, LOOP_MIN_CYCLES,
    MAX_INSNS, MEMORY_COST, RANDOM_BRANCH_LIKELIHOOD, VAR_REUSE_LIKELIHOOD,
};
use crate::crypto::hash;

/// Frame marker in the variable stack.
const FRAME: u32 = u32::MAX;

struct Rng {
    seed: [u8; 32],
    buf: [u32; 16],
    next: usize,
    ctr: u32,
}

impl Rng {
    fn new(seed: &[u8; 32]) -> Self {
        Rng { seed: *seed, buf: [0; 16], next: 16, ctr: 0 }
    }

    fn next_u32(&mut self) -> u32 {
        if self.next >= self.buf.len() {
            let mut bytes = [0u8; 64];
            hash::expand(&mut bytes, &self.seed, self.ctr);
            self.ctr += 1;
            for (i, w) in bytes.chunks_exact(4).enumerate() {
                self.buf[i] = u32::from_le_bytes(w.try_into().unwrap());
            }
            self.next = 0;
        }
        let v = self.buf[self.next];
        self.next += 1;
        v
    }

    fn coin(&mut self, one_in: u32) -> bool {
        self.next_u32() % one_in == 0
    }

    /// Uniform-ish draw in `[start, end)`.
    fn range(&mut self, start: u32, end: u32) -> u32 {
        self.next_u32() % (end - start) + start
    }
}

#[derive(Clone, Copy)]
enum OpClass {
    C11,
    C21,
    C22,
    C42,
    C44,
}

impl OpClass {
    fn cost(self) -> u32 {
        match self {
            OpClass::C11 => 1,
            OpClass::C21 => 2,
            OpClass::C22 => 4,
            OpClass::C42 => 8,
            OpClass::C44 => 16,
        }
    }
}

fn spend(budget: &mut u32, amount: u32) -> bool {
    if *budget >= amount {
        *budget -= amount;
        true
    } else {
        false
    }
}

fn pick(table: &[u32], rand: u32) -> u32 {
    table[rand as usize % table.len()]
}

struct Gen<'a> {
    rng: Rng,
    insns: &'a mut [u32; MAX_INSNS],
    count: usize,
    vars: Vec<u32>,
    scope: u32,
    too_big: bool,
}

impl Gen<'_> {
    fn emit(&mut self, insn: u32) {
        debug_assert!(op::op(insn) > op::INVALID_ZERO && op::op(insn) < op::INVALID_BIG);
        if self.count >= MAX_INSNS {
            self.too_big = true;
            return;
        }
        self.insns[self.count] = insn;
        self.count += 1;
    }

    fn scope_open(&mut self) {
        self.scope += 1;
        self.vars.push(FRAME);
    }

    fn scope_end(&mut self) {
        self.emit(op::END);
        self.scope -= 1;
        while self.vars.pop() != Some(FRAME) {}
    }

    fn mk_var(&mut self) {
        self.vars.push(0);
    }

    /// Select an existing variable to read. `dbl` asks for the high half of
    /// a 64-bit pair, in which case the slot below must also be a variable.
    /// Walks toward older frames with diminishing probability.
    fn get_var(&mut self, dbl: bool) -> usize {
        let mut eof = self.vars.len() as i64;
        let mut bof = eof - 1;
        while bof >= 0 {
            if self.vars[bof as usize] != FRAME {
                bof -= 1;
                continue;
            }
            // frame too small for what we need: keep looking upward
            let frame_too_small = if dbl { bof >= eof - 2 } else { bof >= eof - 1 };
            if !frame_too_small {
                if bof == 0 {
                    break;
                }
                if !self.rng.coin(HIGHER_SCOPE_LIKELIHOOD) {
                    break;
                }
            }
            eof = bof;
            bof -= 1;
        }
        assert!(bof >= 0, "variable stack underflow");
        let start = i64::from(self.rng.range((bof + 1) as u32, eof as u32));
        let mut j = start + 1;
        let out = loop {
            if j >= eof {
                j = bof + 1;
            }
            if (!dbl || j > bof + 1) && self.rng.coin(VAR_REUSE_LIKELIHOOD) {
                break j as usize;
            }
            if self.vars[j as usize] & 1 == 0 && (!dbl || self.vars[(j - 1) as usize] & 1 == 0) {
                break j as usize;
            }
            j += 1;
        };
        assert!(self.vars[out] != FRAME);
        self.vars[out] |= 1;
        if dbl {
            assert!(out > 0 && self.vars[out - 1] != FRAME);
            self.vars[out - 1] |= 1;
        }
        out
    }

    fn get_a(&mut self, dbl: bool) -> u32 {
        (self.get_var(dbl) as u32) << 9
    }

    fn get_b(&mut self, dbl: bool) -> u32 {
        if self.rng.coin(IMMEDIATE_LIKELIHOOD) {
            (self.rng.next_u32() << 20) | (1 << 18)
        } else {
            (self.get_var(dbl) as u32) << 20
        }
    }

    fn emit_op(&mut self, class: OpClass, budget: &mut u32) -> bool {
        let rand = self.rng.next_u32();
        if !spend(budget, class.cost()) {
            return false;
        }
        match class {
            OpClass::C11 => {
                let a = self.get_a(false);
                self.emit(pick(&op::CODES_1_1, rand) | a);
                self.mk_var();
            }
            OpClass::C21 => {
                let a = self.get_a(false);
                let b = self.get_b(false);
                self.emit(pick(&op::CODES_2_1, rand) | a | b);
                self.mk_var();
            }
            OpClass::C22 => {
                let a = self.get_a(false);
                let b = self.get_b(false);
                self.emit(pick(&op::CODES_2_2, rand) | a | b);
                self.mk_var();
                self.mk_var();
            }
            OpClass::C42 => {
                let a = self.get_a(true);
                let b = self.get_b(true);
                self.emit(pick(&op::CODES_4_2, rand) | a | b);
                self.mk_var();
                self.mk_var();
            }
            OpClass::C44 => {
                let a = self.get_a(true);
                let b = self.get_b(true);
                self.emit(pick(&op::CODES_4_4, rand) | a | b);
                self.mk_var();
                self.mk_var();
                self.mk_var();
                self.mk_var();
            }
        }
        true
    }

    fn emit_input(&mut self, budget: &mut u32) -> bool {
        if !spend(budget, INPUT_COST) {
            return false;
        }
        self.mk_var();
        let r = self.rng.next_u32();
        self.emit((r << 8) | op::IN);
        true
    }

    fn emit_branch(&mut self, budget: &mut u32) -> bool {
        if !spend(budget, BRANCH_COST) {
            return false;
        }
        let opc = if self.rng.coin(RANDOM_BRANCH_LIKELIHOOD) { op::IF_RANDOM } else { op::IF_LIKELY };
        let a = self.get_a(false);
        self.emit(a | opc | (2 << 20));
        let j1 = self.count;
        self.emit(op::JMP);

        let mut b1 = if_body_budget(*budget, self.scope);
        self.body(&mut b1, true);

        let j2 = self.count;
        self.emit(op::JMP);

        let mut b2 = if_body_budget(*budget, self.scope);
        self.body(&mut b2, true);

        if !self.too_big {
            debug_assert!((j2 - j1) < (1 << 23));
            debug_assert!((self.count - j2) < (1 << 23));
            // backpatch the taken jump, then the else jump
            self.insns[j1] = (((j2 - j1) as u32) << 8) | op::JMP;
            self.insns[j2] = (((self.count - j2 - 1) as u32) << 8) | op::JMP;
        }
        true
    }

    fn emit_loop(&mut self, budget: &mut u32) {
        let loop_len = self.rng.range(LOOP_MIN_CYCLES, loop_max_cycles(self.scope));
        // at least 2
        let num_mem_acc = self.rng.range(2, 4);

        if *budget < MEMORY_COST * loop_len {
            return;
        }
        *budget /= loop_len;
        self.emit((loop_len << 20) | op::LOOP);
        self.scope_open();

        let mem_template = (self.rng.next_u32() << 8) | op::MEMORY;
        for _ in 0..num_mem_acc {
            if !spend(budget, MEMORY_COST) {
                break;
            }
            self.mk_var();
            let carry = self.rng.next_u32();
            self.emit(op::memory_with_carry(mem_template, carry));
        }
        self.body(budget, false);
        self.scope_end();
    }

    fn body(&mut self, budget: &mut u32, create_scope: bool) {
        if create_scope {
            self.scope_open();
        }
        'emit: loop {
            if self.count > MAX_INSNS {
                break;
            }
            let max = i64::from(self.rng.range(2, 12));
            let mut i = 1i64;
            while i <= max {
                if self.rng.coin((4 * max / i) as u32) && self.emit_op(OpClass::C44, budget) {
                    i += 1;
                    continue;
                }
                if self.rng.coin((3 * max / i) as u32) && self.emit_op(OpClass::C42, budget) {
                    i += 1;
                    continue;
                }
                if self.rng.coin((3 * max / i) as u32) && self.emit_op(OpClass::C22, budget) {
                    i += 1;
                    continue;
                }
                if self.rng.coin((2 * max / i) as u32) && self.emit_op(OpClass::C21, budget) {
                    i += 1;
                    continue;
                }
                if self.rng.coin(i as u32) && self.emit_input(budget) {
                    i += 1;
                    continue;
                }
                if self.emit_op(OpClass::C11, budget) {
                    i += 1;
                    continue;
                }
                break 'emit;
            }
            let r = self.rng.next_u32();
            if should_branch(r, self.count) && !self.emit_branch(budget) {
                break;
            }
            let r = self.rng.next_u32();
            if should_loop(r) {
                // a loop consumes the remaining budget share; this body is done
                self.emit_loop(budget);
                break;
            }
        }
        if create_scope {
            self.scope_end();
        }
    }
}

/// Generate a program into `buf`, returning the instruction count.
///
/// Words past the returned length are left untouched; version-1 item
/// generation deliberately reads them as leftover seed expansion.
pub fn generate(buf: &mut [u32; MAX_INSNS], seed: &[u8; 32]) -> Result<usize, ProgramError> {
    let mut budget = INITIAL_BUDGET;
    let mut g = Gen {
        rng: Rng::new(seed),
        insns: buf,
        count: 0,
        vars: Vec::new(),
        scope: 0,
        too_big: false,
    };
    g.emit_loop(&mut budget);
    if g.too_big {
        return Err(ProgramError::TooBig);
    }
    Ok(g.count)
}
