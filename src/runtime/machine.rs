//! Instruction-stream evaluator.
//!
//! Stands in for the external encoder and CPU: executes the exact
//! [`Instr`](crate::instr::Instr) records the code generator emitted,
//! against a [`Context`] arena. The generated garbage collector and error
//! stubs run here the same way they would as native code.

use std::io::Write;

use crate::instr::regs::{self, NUM_REGS};
use crate::instr::{Cond, Instr, Label, Linked};
use crate::runtime::context::Context;
use crate::runtime::layout::{self, Word};

/// A foreign function callable from generated code through
/// `Instr::ForeignCall`. Raw (marshalled) arguments arrive from the
/// argument registers; the raw result is placed in `RES`.
pub enum ForeignFn {
    /// Render the tagged word in the first argument to the output, using
    /// `display` conventions (strings unquoted).
    Display,
    /// Render the tagged word using `write` conventions (strings quoted).
    WriteRepr,
    /// Write the raw code point in the first argument to the output.
    PutChar,
    User(Box<dyn FnMut(&mut Context, &[u64; 3]) -> u64>),
}

impl ForeignFn {
    /// The builtin implementation for a foreign declaration name, if any.
    pub fn builtin(name: &str) -> Option<ForeignFn> {
        match name {
            "sys/display" => Some(ForeignFn::Display),
            "sys/write" => Some(ForeignFn::WriteRepr),
            "sys/put-char" => Some(ForeignFn::PutChar),
            _ => None,
        }
    }
}

/// Default step budget; hitting it means runaway generated code.
const DEFAULT_STEP_LIMIT: u64 = 500_000_000;

pub struct Machine {
    pub ctx: Context,
    code: Vec<Instr>,
    label_addr: Vec<u64>,
    regs: [u64; NUM_REGS],
    foreigns: Vec<Option<ForeignFn>>,
    output: Box<dyn Write>,
    step_limit: u64,
}

impl Machine {
    /// Build a machine over linked code. `foreign_names` lists the declared
    /// foreign functions in `ForeignCall` index order; builtins are bound
    /// automatically, others must be registered before `run`.
    pub fn new(
        ctx: Context,
        code: Vec<Instr>,
        linked: &Linked,
        foreign_names: &[String],
    ) -> Machine {
        let mut ctx = ctx;
        for (addr, words) in &linked.data {
            for (i, w) in words.iter().enumerate() {
                ctx.write_u64(addr + 8 * i as u64, *w);
            }
        }
        let foreigns = foreign_names
            .iter()
            .map(|name| ForeignFn::builtin(name))
            .collect();
        Machine {
            ctx,
            code,
            label_addr: linked.label_addr.clone(),
            regs: [0; NUM_REGS],
            foreigns,
            output: Box::new(std::io::stdout()),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_output(mut self, output: Box<dyn Write>) -> Machine {
        self.output = output;
        self
    }

    pub fn with_step_limit(mut self, limit: u64) -> Machine {
        self.step_limit = limit;
        self
    }

    pub fn register_foreign(
        &mut self,
        index: usize,
        hook: Box<dyn FnMut(&mut Context, &[u64; 3]) -> u64>,
    ) {
        self.foreigns[index] = Some(ForeignFn::User(hook));
    }

    pub fn reg(&self, r: crate::instr::Reg) -> u64 {
        self.regs[r.0 as usize]
    }

    fn addr_of(&self, label: Label) -> Result<u64, String> {
        match self.label_addr.get(label.0 as usize) {
            Some(&a) if a != u64::MAX => Ok(a),
            _ => Err(format!("unresolved label {:?}", label)),
        }
    }

    /// Execute from `entry` until `Halt`; returns the word left in `RES`.
    pub fn run(&mut self, entry: Label) -> Result<Word, String> {
        let mut pc = (self.addr_of(entry)? / 8) as usize;
        let mut steps = 0u64;
        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err("step limit exceeded".to_string());
            }
            let instr = self
                .code
                .get(pc)
                .ok_or_else(|| format!("pc {} out of code range", pc))?
                .clone();
            pc += 1;
            match instr {
                Instr::Label(_) | Instr::Nop | Instr::Data { .. } => {}
                Instr::Mov { dst, src } => self.regs[dst.0 as usize] = self.regs[src.0 as usize],
                Instr::MovImm { dst, imm } => self.regs[dst.0 as usize] = imm,
                Instr::LoadLabel { dst, label } => {
                    self.regs[dst.0 as usize] = self.addr_of(label)?;
                }
                Instr::Load { dst, base, offset } => {
                    let addr = self.regs[base.0 as usize].wrapping_add_signed(offset as i64);
                    self.check_addr(addr)?;
                    self.regs[dst.0 as usize] = self.ctx.read_u64(addr);
                }
                Instr::Store { src, base, offset } => {
                    let addr = self.regs[base.0 as usize].wrapping_add_signed(offset as i64);
                    self.check_addr(addr)?;
                    self.ctx.write_u64(addr, self.regs[src.0 as usize]);
                }
                Instr::LoadIdx { dst, base, index } => {
                    let addr =
                        self.regs[base.0 as usize].wrapping_add(self.regs[index.0 as usize]);
                    self.check_addr(addr)?;
                    self.regs[dst.0 as usize] = self.ctx.read_u64(addr);
                }
                Instr::StoreIdx { src, base, index } => {
                    let addr =
                        self.regs[base.0 as usize].wrapping_add(self.regs[index.0 as usize]);
                    self.check_addr(addr)?;
                    self.ctx.write_u64(addr, self.regs[src.0 as usize]);
                }
                Instr::Add { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize].wrapping_add(self.regs[b.0 as usize]);
                }
                Instr::AddImm { dst, a, imm } => {
                    self.regs[dst.0 as usize] = self.regs[a.0 as usize].wrapping_add_signed(imm);
                }
                Instr::Sub { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize].wrapping_sub(self.regs[b.0 as usize]);
                }
                Instr::Mul { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize].wrapping_mul(self.regs[b.0 as usize]);
                }
                Instr::Div { dst, a, b } => {
                    let d = self.regs[b.0 as usize] as i64;
                    if d == 0 {
                        return Err("division by zero reached the machine".to_string());
                    }
                    self.regs[dst.0 as usize] =
                        ((self.regs[a.0 as usize] as i64).wrapping_div(d)) as u64;
                }
                Instr::Rem { dst, a, b } => {
                    let d = self.regs[b.0 as usize] as i64;
                    if d == 0 {
                        return Err("division by zero reached the machine".to_string());
                    }
                    self.regs[dst.0 as usize] =
                        ((self.regs[a.0 as usize] as i64).wrapping_rem(d)) as u64;
                }
                Instr::And { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize] & self.regs[b.0 as usize];
                }
                Instr::AndImm { dst, a, imm } => {
                    self.regs[dst.0 as usize] = self.regs[a.0 as usize] & imm;
                }
                Instr::Or { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize] | self.regs[b.0 as usize];
                }
                Instr::OrImm { dst, a, imm } => {
                    self.regs[dst.0 as usize] = self.regs[a.0 as usize] | imm;
                }
                Instr::Xor { dst, a, b } => {
                    self.regs[dst.0 as usize] =
                        self.regs[a.0 as usize] ^ self.regs[b.0 as usize];
                }
                Instr::Shl { dst, a, amount } => {
                    self.regs[dst.0 as usize] = self.regs[a.0 as usize] << amount;
                }
                Instr::Shr { dst, a, amount } => {
                    self.regs[dst.0 as usize] = self.regs[a.0 as usize] >> amount;
                }
                Instr::Sar { dst, a, amount } => {
                    self.regs[dst.0 as usize] =
                        ((self.regs[a.0 as usize] as i64) >> amount) as u64;
                }
                Instr::Itof { dst, a } => {
                    self.regs[dst.0 as usize] =
                        ((self.regs[a.0 as usize] as i64) as f64).to_bits();
                }
                Instr::Ftoi { dst, a } => {
                    self.regs[dst.0 as usize] =
                        (f64::from_bits(self.regs[a.0 as usize]) as i64) as u64;
                }
                Instr::FAdd { dst, a, b } => self.fop(dst, a, b, |x, y| x + y),
                Instr::FSub { dst, a, b } => self.fop(dst, a, b, |x, y| x - y),
                Instr::FMul { dst, a, b } => self.fop(dst, a, b, |x, y| x * y),
                Instr::FDiv { dst, a, b } => self.fop(dst, a, b, |x, y| x / y),
                Instr::Jmp { target } => pc = (self.addr_of(target)? / 8) as usize,
                Instr::JmpReg { target } => pc = (self.regs[target.0 as usize] / 8) as usize,
                Instr::Jcc { cond, a, b, target } => {
                    let x = self.regs[a.0 as usize] as i64;
                    let y = self.regs[b.0 as usize] as i64;
                    if take_branch(cond, x, y) {
                        pc = (self.addr_of(target)? / 8) as usize;
                    }
                }
                Instr::JccImm { cond, a, imm, target } => {
                    let x = self.regs[a.0 as usize] as i64;
                    if take_branch(cond, x, imm) {
                        pc = (self.addr_of(target)? / 8) as usize;
                    }
                }
                Instr::FJcc { cond, a, b, target } => {
                    let x = f64::from_bits(self.regs[a.0 as usize]);
                    let y = f64::from_bits(self.regs[b.0 as usize]);
                    let take = match cond {
                        Cond::Eq => x == y,
                        Cond::Ne => x != y,
                        Cond::Lt => x < y,
                        Cond::Le => x <= y,
                        Cond::Gt => x > y,
                        Cond::Ge => x >= y,
                    };
                    if take {
                        pc = (self.addr_of(target)? / 8) as usize;
                    }
                }
                Instr::ForeignCall { index } => self.foreign_call(index as usize)?,
                Instr::Halt => return Ok(Word(self.regs[regs::RES.0 as usize])),
            }
        }
    }

    fn check_addr(&self, addr: u64) -> Result<(), String> {
        if addr % 8 != 0 || addr + 8 > self.ctx.layout.total_bytes {
            return Err(format!("bad memory access at {:#x}", addr));
        }
        Ok(())
    }

    fn fop(&mut self, dst: crate::instr::Reg, a: crate::instr::Reg, b: crate::instr::Reg, op: fn(f64, f64) -> f64) {
        let x = f64::from_bits(self.regs[a.0 as usize]);
        let y = f64::from_bits(self.regs[b.0 as usize]);
        self.regs[dst.0 as usize] = op(x, y).to_bits();
    }

    fn foreign_call(&mut self, index: usize) -> Result<(), String> {
        let args = [
            self.regs[regs::ARG0.0 as usize],
            self.regs[regs::ARG1.0 as usize],
            self.regs[regs::ARG2.0 as usize],
        ];
        let result = match self.foreigns.get_mut(index) {
            Some(Some(ForeignFn::Display)) => {
                let text = render_word(&self.ctx, Word(args[0]), false);
                self.output
                    .write_all(text.as_bytes())
                    .map_err(|e| e.to_string())?;
                Word::VOID.0
            }
            Some(Some(ForeignFn::WriteRepr)) => {
                let text = render_word(&self.ctx, Word(args[0]), true);
                self.output
                    .write_all(text.as_bytes())
                    .map_err(|e| e.to_string())?;
                Word::VOID.0
            }
            Some(Some(ForeignFn::PutChar)) => {
                let c = char::from_u32(args[0] as u32).unwrap_or('\u{fffd}');
                let mut buf = [0u8; 4];
                self.output
                    .write_all(c.encode_utf8(&mut buf).as_bytes())
                    .map_err(|e| e.to_string())?;
                Word::VOID.0
            }
            Some(Some(ForeignFn::User(hook))) => hook(&mut self.ctx, &args),
            _ => return Err(format!("foreign function {} is not registered", index)),
        };
        self.regs[regs::RES.0 as usize] = result;
        Ok(())
    }
}

fn take_branch(cond: Cond, a: i64, b: i64) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Lt => a < b,
        Cond::Le => a <= b,
        Cond::Gt => a > b,
        Cond::Ge => a >= b,
    }
}

/// Render a tagged word by walking the context heap.
pub fn render_word(ctx: &Context, w: Word, repr: bool) -> String {
    if w.is_fixnum() {
        return w.as_fixnum().to_string();
    }
    if w == Word::TRUE {
        return "#t".to_string();
    }
    if w == Word::FALSE {
        return "#f".to_string();
    }
    if w == Word::NIL {
        return "()".to_string();
    }
    if w == Word::VOID {
        return "#<void>".to_string();
    }
    if w == Word::EOF {
        return "#<eof>".to_string();
    }
    if let Some(code) = w.error_code() {
        return format!("#<error: {}>", code.describe());
    }
    if w.is_char() {
        let c = w.as_char().unwrap_or('\u{fffd}');
        return if repr {
            format!("#\\{}", c)
        } else {
            c.to_string()
        };
    }
    if w.is_primitive() {
        return "#<primitive>".to_string();
    }
    if w.is_block_ptr() {
        let header = ctx.block_header(w);
        let count = layout::header_count(header);
        return match layout::header_type(header) {
            layout::BlockType::Flonum => {
                let f = f64::from_bits(ctx.block_field(w, 0).0);
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{}.0", f)
                } else {
                    format!("{}", f)
                }
            }
            layout::BlockType::Pair => {
                let mut parts = Vec::new();
                let mut cur = w;
                loop {
                    parts.push(render_word(ctx, ctx.block_field(cur, 0), repr));
                    let cdr = ctx.block_field(cur, 1);
                    if cdr == Word::NIL {
                        break format!("({})", parts.join(" "));
                    }
                    if cdr.is_block_ptr()
                        && layout::header_type(ctx.block_header(cdr)) == layout::BlockType::Pair
                    {
                        cur = cdr;
                    } else {
                        parts.push(".".to_string());
                        parts.push(render_word(ctx, cdr, repr));
                        break format!("({})", parts.join(" "));
                    }
                }
            }
            layout::BlockType::Vector => {
                let parts: Vec<String> = (0..count)
                    .map(|i| render_word(ctx, ctx.block_field(w, i), repr))
                    .collect();
                format!("#({})", parts.join(" "))
            }
            layout::BlockType::String => {
                let text = ctx.block_text(w);
                if repr {
                    format!("{:?}", text)
                } else {
                    text
                }
            }
            layout::BlockType::Symbol => ctx.block_text(w),
            layout::BlockType::Closure => "#<procedure>".to_string(),
            layout::BlockType::Port => "#<port>".to_string(),
            layout::BlockType::Promise => "#<promise>".to_string(),
        };
    }
    format!("#<word {:#x}>", w.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerOptions;
    use crate::instr::{link, Asm, LabelAlloc};
    use crate::runtime::context::ContextLayout;

    fn run_snippet(build: impl FnOnce(&mut Asm, Label)) -> Word {
        let options = CompilerOptions::default();
        let labels = LabelAlloc::new();
        let entry = labels.fresh();
        let mut asm = Asm::new(&labels);
        asm.bind(entry);
        build(&mut asm, entry);
        asm.push(Instr::Halt);
        let instrs = asm.into_instrs();
        let layout = ContextLayout::new(&options, 0);
        let linked = link(&instrs, labels.count(), &layout);
        let ctx = Context::new(layout, &[]);
        let mut machine =
            Machine::new(ctx, instrs, &linked, &[]).with_output(Box::new(Vec::new()));
        machine.run(entry).expect("snippet runs")
    }

    #[test]
    fn test_mov_imm_and_halt() {
        let w = run_snippet(|asm, _| {
            asm.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::fixnum(7).0,
            });
        });
        assert_eq!(w.as_fixnum(), 7);
    }

    #[test]
    fn test_arithmetic_and_branch() {
        let w = run_snippet(|asm, _| {
            let done = asm.fresh_label();
            asm.push(Instr::MovImm { dst: regs::TMP0, imm: 40 });
            asm.push(Instr::AddImm { dst: regs::TMP0, a: regs::TMP0, imm: 2 });
            asm.push(Instr::MovImm { dst: regs::RES, imm: Word::fixnum(1).0 });
            asm.push(Instr::JccImm {
                cond: Cond::Eq,
                a: regs::TMP0,
                imm: 42,
                target: done,
            });
            asm.push(Instr::MovImm { dst: regs::RES, imm: Word::fixnum(0).0 });
            asm.bind(done);
        });
        assert_eq!(w.as_fixnum(), 1);
    }

    #[test]
    fn test_context_loads_and_stores() {
        let w = run_snippet(|asm, _| {
            // Store through the locals region and read it back.
            let options = CompilerOptions::default();
            let layout = ContextLayout::new(&options, 0);
            asm.push(Instr::MovImm {
                dst: regs::TMP0,
                imm: Word::fixnum(99).0,
            });
            asm.push(Instr::Store {
                src: regs::TMP0,
                base: regs::CTX,
                offset: layout.local_offset(3) as i32,
            });
            asm.push(Instr::Load {
                dst: regs::RES,
                base: regs::CTX,
                offset: layout.local_offset(3) as i32,
            });
        });
        assert_eq!(w.as_fixnum(), 99);
    }

    #[test]
    fn test_jmp_reg_through_label_address() {
        let w = run_snippet(|asm, _| {
            let target = asm.fresh_label();
            asm.push(Instr::LoadLabel { dst: regs::TMP1, label: target });
            asm.push(Instr::JmpReg { target: regs::TMP1 });
            asm.push(Instr::MovImm { dst: regs::RES, imm: Word::fixnum(0).0 });
            asm.push(Instr::Halt);
            asm.bind(target);
            asm.push(Instr::MovImm { dst: regs::RES, imm: Word::fixnum(5).0 });
        });
        assert_eq!(w.as_fixnum(), 5);
    }

    #[test]
    fn test_float_ops_on_bit_patterns() {
        let w = run_snippet(|asm, _| {
            asm.push(Instr::MovImm { dst: regs::TMP0, imm: 1.5f64.to_bits() });
            asm.push(Instr::MovImm { dst: regs::TMP1, imm: 2.25f64.to_bits() });
            asm.push(Instr::FAdd { dst: regs::RES, a: regs::TMP0, b: regs::TMP1 });
        });
        assert_eq!(f64::from_bits(w.0), 3.75);
    }
}
