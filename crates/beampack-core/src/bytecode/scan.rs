//! Generic instruction walk with an accumulator.

use super::disasm::Instruction;
use crate::module::BeamModule;

/// Where an instruction lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    /// Module name.
    pub module: &'a str,
    /// Enclosing function.
    pub function: &'a str,
    /// Enclosing function arity.
    pub arity: u32,
}

/// Visit every instruction of `module` in code order, threading `acc`.
///
/// The same walk backs opcode extraction and call extraction; callers only
/// differ by their visitor.
pub fn scan<A, F>(module: &BeamModule, acc: A, mut visit: F) -> A
where
    F: FnMut(&Instruction, &Location<'_>, &mut A),
{
    let mut acc = acc;
    for function in &module.code.functions {
        let loc = Location { module: &module.name, function: &function.name, arity: function.arity };
        for instr in &function.instructions {
            visit(instr, &loc, &mut acc);
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        asm::{ModuleBuilder, Operand},
        bytecode::Opcode,
        CoreResult,
    };

    #[test]
    fn visits_in_order_with_location() -> CoreResult<()> {
        let mut b = ModuleBuilder::new("walk");
        b.function("a", 0, true, &[(Opcode::RETURN, vec![])]);
        b.function("b", 2, false, &[(Opcode::MOVE, vec![Operand::X(1), Operand::X(0)]), (Opcode::RETURN, vec![])]);
        let m = BeamModule::parse(&b.build())?;

        let seen = scan(&m, Vec::new(), |instr, loc, acc: &mut Vec<String>| {
            if !matches!(instr.opcode, Opcode::LABEL | Opcode::FUNC_INFO) {
                acc.push(format!("{}:{}/{} {}", loc.module, loc.function, loc.arity, instr.opcode));
            }
        });
        assert_eq!(seen, vec!["walk:a/0 return", "walk:b/2 move", "walk:b/2 return"]);

        let count = scan(&m, 0usize, |_, _, n| *n += 1);
        assert_eq!(count, m.code.instructions().count());
        Ok(())
    }
}
