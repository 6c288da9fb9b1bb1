//! Diagnostic dumps of guest state.
//!
//! Everything here formats into `String`s; callers decide whether to log it.

use std::fmt::{self, Write as _};

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::backend::kvm::Vcpu;
use crate::error::Result;

/// Render the low 32 bits of `value` as a binary string, most significant first.
pub fn format_binary(value: u64) -> String {
    format!("{:032b}", value as u32)
}

/// Hex dump of at most `limit` bytes, 16 per line.
///
/// A truncated dump ends with `...`.
pub fn hex_dump(bytes: &[u8], limit: usize) -> String {
    let shown = &bytes[..bytes.len().min(limit)];
    let mut out = String::with_capacity(shown.len() * 3 + 8);
    for (i, line) in shown.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for byte in line {
            let _ = write!(out, " {byte:02x}");
        }
    }
    if bytes.len() > limit {
        out.push_str(" ...");
    }
    out
}

/// Snapshot of the registers worth looking at after an exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterDump {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub es_base: u64,
    pub gdt_base: u64,
    pub gdt_limit: u16,
    pub idt_base: u64,
    pub idt_limit: u16,
}

impl RegisterDump {
    /// Read the current registers of `vcpu`.
    pub fn capture(vcpu: &Vcpu) -> Result<Self> {
        let regs = vcpu.get_regs()?;
        let sregs = vcpu.get_sregs()?;
        Ok(Self::from_kvm(&regs, &sregs))
    }

    /// Build a dump from raw KVM register structures.
    pub fn from_kvm(regs: &kvm_regs, sregs: &kvm_sregs) -> Self {
        Self {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rip: regs.rip,
            rsp: regs.rsp,
            rbp: regs.rbp,
            rflags: regs.rflags,
            cr0: sregs.cr0,
            cr2: sregs.cr2,
            cr3: sregs.cr3,
            cr4: sregs.cr4,
            cr8: sregs.cr8,
            efer: sregs.efer,
            es_base: sregs.es.base,
            gdt_base: sregs.gdt.base,
            gdt_limit: sregs.gdt.limit,
            idt_base: sregs.idt.base,
            idt_limit: sregs.idt.limit,
        }
    }
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " rax:{:016x}, rbx:{:016x}, rcx:{:016x}, rdx:{:016x}, rip:{:016x}",
            self.rax, self.rbx, self.rcx, self.rdx, self.rip
        )?;
        writeln!(
            f,
            " rsp:{:016x}, rbp:{:016x}, rflags:{:016x}",
            self.rsp, self.rbp, self.rflags
        )?;
        writeln!(
            f,
            " cr0:{:016x}, cr2:{:016x}, cr3:{:016x}, cr4:{:016x}, cr8:{:016x}",
            self.cr0, self.cr2, self.cr3, self.cr4, self.cr8
        )?;
        writeln!(f, " efer:{:016x}, es.base:{:016x}", self.efer, self.es_base)?;
        writeln!(
            f,
            " gdt:{:016x}/{:04x}, idt:{:016x}/{:04x}",
            self.gdt_base, self.gdt_limit, self.idt_base, self.idt_limit
        )?;
        writeln!(f, " cr0:    {}", format_binary(self.cr0))?;
        writeln!(f, " cr4:    {}", format_binary(self.cr4))?;
        write!(f, " rflags: {}", format_binary(self.rflags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_binary() {
        assert_eq!(format_binary(0x202), "00000000000000000000001000000010");
        assert_eq!(format_binary(0x8000_0011), "10000000000000000000000000010001");
        assert_eq!(format_binary(0xffff_ffff_0000_0001).len(), 32);
    }

    #[test]
    fn test_hex_dump_lines() {
        let bytes: Vec<u8> = (0..20).collect();
        let dump = hex_dump(&bytes, 80);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(" 00 01 02"));
        assert!(lines[0].ends_with(" 0f"));
        assert_eq!(lines[1], " 10 11 12 13");
    }

    #[test]
    fn test_hex_dump_truncates() {
        let bytes = vec![0xfe; 100];
        let dump = hex_dump(&bytes, 80);
        assert!(dump.ends_with(" ..."));
        assert_eq!(dump.matches("fe").count(), 80);
        assert_eq!(hex_dump(&[], 80), "");
    }

    #[test]
    fn test_register_dump_display() {
        let regs = kvm_regs {
            rip: 0x10001,
            rsp: 0x10000,
            rflags: 0x202,
            ..Default::default()
        };
        let mut sregs = kvm_sregs {
            cr0: 0x8000_0011,
            cr3: 0x1000,
            ..Default::default()
        };
        sregs.gdt.base = 0x5000;
        sregs.gdt.limit = 31;
        let dump = RegisterDump::from_kvm(&regs, &sregs);
        assert_eq!((dump.gdt_base, dump.gdt_limit), (0x5000, 31));
        assert_eq!((dump.idt_base, dump.idt_limit), (0, 0));
        let text = dump.to_string();
        assert!(text.contains("rip:0000000000010001"));
        assert!(text.contains("cr3:0000000000001000"));
        assert!(text.contains(" rflags: 00000000000000000000001000000010"));
        assert!(text.contains("gdt:0000000000005000/001f"));
    }
}
