//! `upatch-manage` — applies and removes live ELF hot patches to running
//! processes via `ptrace`, without a compiler wrapper, kernel module, or
//! `uprobe` monitor (those remain external collaborators).

pub mod arch;
pub mod cli;
pub mod elf_model;
pub mod error;
pub mod layout;
pub mod patch_ops;
pub mod process;
pub mod ptrace_driver;
pub mod relocation;
pub mod resolve;
pub mod stack_check;
pub mod trampoline;
