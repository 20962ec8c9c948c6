//! Textual x86 (NASM syntax) assembly emission.
//!
//! Every SSA value lives in the stack slot at `[esp + serial*4]` for the
//! lifetime of the subroutine; there is no register allocation. `eax`,
//! `ebx`, `ecx` and the byte registers `ch`/`cl` are scratch.

use slzprog_core::{Function, InstrId, Instruction, LowerError, Opcode};

use crate::CodegenError;

/// The fixed address of `kernel32.dll!ExitProcess`'s IAT slot in the default
/// import layout: `ExitProcess` is always the first of the twelve
/// `kernel32_default()` symbols, and with a single imported DLL the IAT
/// always starts at `0x00401028`.
const EXIT_PROCESS_ADDR: u32 = 0x0040_1028;

/// Renumbers `func`'s instructions into contiguous stack-slot indices and
/// emits its full prologue/body/epilogue as NASM-syntax assembly text.
///
/// `func` is always the program's entry point, never a callee: the
/// generated image has no CRT startup pushing a return address before
/// jumping to `AddressOfEntryPoint`, so the epilogue cannot `ret` the way
/// an ordinary subroutine would. Instead it calls `ExitProcess` with the
/// return value as the process exit code, which never returns.
pub fn emit_function(func: &mut Function) -> Result<String, CodegenError> {
    let slot_count = func.renumber_instructions();
    let mut out = String::new();

    out.push_str(&format!("; subroutine {}\n", func.name));
    out.push_str(&format!("{}:\n", func.name));
    out.push_str("push ebp\n");
    out.push_str("mov ebp, esp\n");
    out.push_str(&format!("sub esp, {}\n", slot_count * 4));

    emit_list(func, func.code, None, &mut out)?;

    let ret = func
        .ret
        .expect("a lowered function always designates a return instruction");
    out.push_str(&format!("mov eax, [esp+{}*4]\n", func.instr(ret).serial));
    out.push_str("push eax\n");
    out.push_str(&format!("call dword [0x{:08x}]\n", EXIT_PROCESS_ADDR));
    Ok(out)
}

/// Walks one instruction stream. `enclosing_pred`, when set, is the control
/// instruction (a `while`) whose own slot selects the back-edge phis
/// spliced at the very head of this stream.
fn emit_list(
    func: &Function,
    head: Option<InstrId>,
    enclosing_pred: Option<InstrId>,
    out: &mut String,
) -> Result<(), CodegenError> {
    let mut cur = head;
    let mut prev: Option<InstrId> = None;

    while let Some(id) = cur {
        let opcode = func.instr(id).opcode;

        if opcode == Opcode::Phi {
            let follows_control = prev
                .map(|p| {
                    let prev_op = func.instr(p).opcode;
                    prev_op == Opcode::Phi || prev_op.is_if() || prev_op == Opcode::While
                })
                .unwrap_or(false);
            let at_head_of_loop = prev.is_none() && enclosing_pred.is_some();
            if !follows_control && !at_head_of_loop {
                return Err(LowerError::MisplacedPhi.into());
            }

            let mut run = vec![id];
            let mut next = func.instr(id).next;
            while let Some(nid) = next {
                if func.instr(nid).opcode == Opcode::Phi {
                    run.push(nid);
                    next = func.instr(nid).next;
                } else {
                    break;
                }
            }
            let pred = if prev.is_some() { prev } else { enclosing_pred };
            emit_phi_run(func, &run, pred, out)?;
            prev = run.last().copied();
            cur = next;
            continue;
        }

        match opcode {
            op if op.is_if() => emit_if(func, id, out)?,
            Opcode::While => emit_while(func, id, out)?,
            _ => emit_instr(func, id, out)?,
        }
        prev = Some(id);
        cur = func.instr(id).next;
    }
    Ok(())
}

fn slot(func: &Function, id: InstrId) -> u32 {
    func.instr(id).serial
}

fn emit_instr(func: &Function, id: InstrId, out: &mut String) -> Result<(), CodegenError> {
    let instr = func.instr(id);
    let s = instr.serial;
    match instr.opcode {
        Opcode::Const => {
            out.push_str(&format!("mov dword [esp+{}*4], {}\n", s, instr.konst));
        }
        Opcode::Copy => {
            let x = slot(func, instr.arg0.expect("copy has an operand"));
            out.push_str(&format!("mov eax, [esp+{}*4]\n", x));
            out.push_str(&format!("mov [esp+{}*4], eax\n", s));
        }
        Opcode::ZeroExtend | Opcode::SignExtend => {
            let x = slot(func, instr.arg0.expect("extend has an operand"));
            out.push_str(&format!("mov eax, [esp+{}*4]\n", x));
            out.push_str(&format!("mov [esp+{}*4], eax\n", s));
        }
        Opcode::Not | Opcode::Neg => {
            let x = slot(func, instr.arg0.expect("unary op has an operand"));
            out.push_str(&format!("mov eax, [esp+{}*4]\n", x));
            out.push_str(match instr.opcode {
                Opcode::Not => "not eax\n",
                Opcode::Neg => "neg eax\n",
                _ => unreachable!(),
            });
            out.push_str(&format!("mov [esp+{}*4], eax\n", s));
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::UDiv
        | Opcode::IDiv
        | Opcode::UMod
        | Opcode::IMod
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::ShiftLeft
        | Opcode::LogicalShiftRight
        | Opcode::ArithmeticShiftRight
        | Opcode::RotateLeft
        | Opcode::RotateRight => emit_binary(func, instr, out),
        Opcode::UCompare | Opcode::ICompare => emit_compare(func, instr, out),
        Opcode::Return | Opcode::NoOp => {}
        Opcode::Phi => return Err(LowerError::MisplacedPhi.into()),
        Opcode::IfNonzero
        | Opcode::IfZero
        | Opcode::IfNonpositive
        | Opcode::IfPositive
        | Opcode::IfNonnegative
        | Opcode::IfNegative
        | Opcode::While => unreachable!("control opcodes are dispatched by emit_list"),
    }
    Ok(())
}

fn emit_binary(func: &Function, instr: &Instruction, out: &mut String) {
    let s = instr.serial;
    let a = slot(func, instr.arg0.expect("binary op has a left operand"));
    let b = slot(func, instr.arg1.expect("binary op has a right operand"));
    out.push_str(&format!("mov eax, [esp+{}*4]\n", a));
    match instr.opcode {
        Opcode::Add => out.push_str(&format!("add eax, [esp+{}*4]\n", b)),
        Opcode::Sub => out.push_str(&format!("sub eax, [esp+{}*4]\n", b)),
        Opcode::Mul => out.push_str(&format!("imul eax, [esp+{}*4]\n", b)),
        Opcode::And => out.push_str(&format!("and eax, [esp+{}*4]\n", b)),
        Opcode::Or => out.push_str(&format!("or eax, [esp+{}*4]\n", b)),
        Opcode::Xor => out.push_str(&format!("xor eax, [esp+{}*4]\n", b)),
        Opcode::ShiftLeft => {
            out.push_str(&format!("mov ecx, [esp+{}*4]\n", b));
            out.push_str("shl eax, cl\n");
        }
        Opcode::LogicalShiftRight => {
            out.push_str(&format!("mov ecx, [esp+{}*4]\n", b));
            out.push_str("shr eax, cl\n");
        }
        Opcode::ArithmeticShiftRight => {
            out.push_str(&format!("mov ecx, [esp+{}*4]\n", b));
            out.push_str("sar eax, cl\n");
        }
        Opcode::RotateLeft => {
            out.push_str(&format!("mov ecx, [esp+{}*4]\n", b));
            out.push_str("rol eax, cl\n");
        }
        Opcode::RotateRight => {
            out.push_str(&format!("mov ecx, [esp+{}*4]\n", b));
            out.push_str("ror eax, cl\n");
        }
        Opcode::UDiv | Opcode::UMod => {
            out.push_str("xor edx, edx\n");
            out.push_str(&format!("div dword [esp+{}*4]\n", b));
            if instr.opcode == Opcode::UMod {
                out.push_str("mov eax, edx\n");
            }
        }
        Opcode::IDiv | Opcode::IMod => {
            out.push_str("cdq\n");
            out.push_str(&format!("idiv dword [esp+{}*4]\n", b));
            if instr.opcode == Opcode::IMod {
                out.push_str("mov eax, edx\n");
            }
        }
        _ => unreachable!(),
    }
    out.push_str(&format!("mov [esp+{}*4], eax\n", s));
}

fn emit_compare(func: &Function, instr: &Instruction, out: &mut String) {
    let s = instr.serial;
    let a = slot(func, instr.arg0.expect("compare has a left operand"));
    let b = slot(func, instr.arg1.expect("compare has a right operand"));
    let (gt, lt) = match instr.opcode {
        Opcode::UCompare => ("seta", "setb"),
        Opcode::ICompare => ("setg", "setl"),
        _ => unreachable!(),
    };
    out.push_str(&format!("mov eax, [esp+{}*4]\n", a));
    out.push_str(&format!("cmp eax, [esp+{}*4]\n", b));
    out.push_str("mov ch, 0\n");
    out.push_str("mov cl, 0\n");
    out.push_str(&format!("{} ch\n", gt));
    out.push_str(&format!("{} cl\n", lt));
    out.push_str("sub ch, cl\n");
    out.push_str("movsx eax, ch\n");
    out.push_str(&format!("mov [esp+{}*4], eax\n", s));
}

/// `cmp`; branch to `.L<S>_else` on the complement of the predicate; emit
/// the `then` body, store 1, jump to `.L<S>_end`; emit the `else` body,
/// store 0; fall through to `.L<S>_end`. The instruction's own slot then
/// holds 1 or 0 according to which arm ran, available to a downstream φ.
fn emit_if(func: &Function, id: InstrId, out: &mut String) -> Result<(), CodegenError> {
    let instr = func.instr(id);
    let s = instr.serial;
    let cond = slot(func, instr.arg0.expect("if has a condition operand"));
    let jump_to_else = match instr.opcode {
        Opcode::IfNonzero => "je",
        Opcode::IfZero => "jne",
        Opcode::IfPositive => "jle",
        Opcode::IfNonpositive => "jg",
        Opcode::IfNegative => "jge",
        Opcode::IfNonnegative => "jl",
        _ => unreachable!(),
    };
    let (list0, list1) = (instr.list0, instr.list1);

    out.push_str(&format!("cmp dword [esp+{}*4], 0\n", cond));
    out.push_str(&format!("{} .L{}_else\n", jump_to_else, s));
    emit_list(func, list0, None, out)?;
    out.push_str(&format!("mov dword [esp+{}*4], 1\n", s));
    out.push_str(&format!("jmp .L{}_end\n", s));
    out.push_str(&format!(".L{}_else:\n", s));
    emit_list(func, list1, None, out)?;
    out.push_str(&format!("mov dword [esp+{}*4], 0\n", s));
    out.push_str(&format!(".L{}_end:\n", s));
    Ok(())
}

/// Initialises own slot to 0; loops the body (which starts with any
/// back-edge φs, then the recompiled condition, then the user body);
/// sets own slot to 1 after one pass; loops back while the condition holds.
fn emit_while(func: &Function, id: InstrId, out: &mut String) -> Result<(), CodegenError> {
    let instr = func.instr(id);
    let s = instr.serial;
    let cond = slot(func, instr.arg0.expect("while has a condition operand"));
    let body = instr.list0;

    out.push_str(&format!("mov dword [esp+{}*4], 0\n", s));
    out.push_str(&format!(".L{}_loop:\n", s));
    emit_list(func, body, Some(id), out)?;
    out.push_str(&format!("mov dword [esp+{}*4], 1\n", s));
    out.push_str(&format!("cmp dword [esp+{}*4], 0\n", cond));
    out.push_str(&format!("jnz .L{}_loop\n", s));
    Ok(())
}

/// A run of `k` consecutive φs executed simultaneously: reserves a k-slot
/// scratch pad, resolves each φ via a `cmovnz` keyed on the low bit of the
/// controlling predecessor's own slot, then commits all k results at once.
fn emit_phi_run(
    func: &Function,
    ids: &[InstrId],
    pred: Option<InstrId>,
    out: &mut String,
) -> Result<(), CodegenError> {
    let pred = pred.ok_or(LowerError::MisplacedPhi)?;
    let k = ids.len() as u32;
    let pred_slot = slot(func, pred);

    out.push_str(&format!("sub esp, {}\n", k * 4));
    for (i, &id) in ids.iter().enumerate() {
        let instr = func.instr(id);
        let taken = slot(func, instr.arg0.expect("phi has a taken-arm operand"));
        let other = slot(func, instr.arg1.expect("phi has an other-arm operand"));
        out.push_str(&format!("mov eax, [esp+{}+{}*4]\n", k * 4, other));
        out.push_str(&format!("mov ebx, [esp+{}+{}*4]\n", k * 4, taken));
        out.push_str(&format!("test dword [esp+{}+{}*4], 1\n", k * 4, pred_slot));
        out.push_str("cmovnz eax, ebx\n");
        out.push_str(&format!("mov [esp+{}*4], eax\n", i));
    }
    for (i, &id) in ids.iter().enumerate() {
        let s = func.instr(id).serial;
        out.push_str(&format!("mov eax, [esp+{}*4]\n", i));
        out.push_str(&format!("mov [esp+{}+{}*4], eax\n", k * 4, s));
    }
    out.push_str(&format!("add esp, {}\n", k * 4));
    Ok(())
}
