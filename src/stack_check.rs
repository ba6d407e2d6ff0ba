//! Active-stack safety check (§4.H).

use crate::error::{Error, Result};
use crate::process::Process;
use crate::ptrace_driver;
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// About to overwrite `old_addr..old_addr+old_size` with a trampoline.
    Active,
    /// About to restore `new_addr..new_addr+new_size` during unpatch.
    Deactive,
}

#[derive(Debug, Clone, Copy)]
pub struct DangerRange {
    pub start: u64,
    pub end: u64,
    pub func_index: usize,
}

/// One danger range per function, per `mode` (§4.H).
pub fn danger_ranges(
    funcs: &[(u64, u64, u64, u64)], // (old_addr, old_size, new_addr, new_size)
    mode: Mode,
) -> Vec<DangerRange> {
    funcs
        .iter()
        .enumerate()
        .map(|(i, &(old_addr, old_size, new_addr, new_size))| match mode {
            Mode::Active => DangerRange {
                start: old_addr,
                end: old_addr + old_size,
                func_index: i,
            },
            Mode::Deactive => DangerRange {
                start: new_addr,
                end: new_addr + new_size,
                func_index: i,
            },
        })
        .collect()
}

fn in_any_range(addr: u64, ranges: &[DangerRange]) -> Option<usize> {
    ranges
        .iter()
        .find(|r| addr >= r.start && addr <= r.end)
        .map(|r| r.func_index)
}

/// Check every attached thread's PC and stack chain against `ranges`,
/// returning the name (by index into `func_names`) of the first function
/// found live on any stack (§4.H steps 1–4).
pub fn check_once(process: &Process, ranges: &[DangerRange], func_names: &[String]) -> Result<()> {
    for ctx in process.contexts() {
        let regs = ptrace_driver::get_regs(ctx.pid)?;

        if let Some(idx) = in_any_range(regs.pc, ranges) {
            return Err(Error::ActiveFunction {
                function: func_names[idx].clone(),
            });
        }

        let mut sp = regs.sp;
        loop {
            let Ok(word) = process.read_mem(sp, 8) else {
                break;
            };
            let ra = u64::from_le_bytes(word.try_into().unwrap());
            if let Some(idx) = in_any_range(ra, ranges) {
                return Err(Error::ActiveFunction {
                    function: func_names[idx].clone(),
                });
            }
            sp += 8;
        }
    }
    Ok(())
}

/// Retry [`check_once`] up to [`crate::arch::STACK_CHECK_RETRY_TIMES`] times
/// (§4.H, §5, §9). A failed attempt detaches every thread, sleeps a second,
/// then re-attaches before checking again — an attached thread stays frozen
/// until it's actually resumed, so re-checking the same frozen snapshot could
/// never observe the target leaving a danger range.
pub fn check_with_retry(process: &mut Process, ranges: &[DangerRange], func_names: &[String]) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=crate::arch::STACK_CHECK_RETRY_TIMES {
        match check_once(process, ranges, func_names) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("stack-safety check attempt {attempt} failed: {e}");
                last_err = Some(e);
                if attempt < crate::arch::STACK_CHECK_RETRY_TIMES {
                    process.detach_threads()?;
                    sleep(Duration::from_secs(1));
                    process.attach_threads()?;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_ranges_pick_correct_side_per_mode() {
        let funcs = vec![(0x1000, 0x10, 0x7f0000, 0x20)];
        let active = danger_ranges(&funcs, Mode::Active);
        assert_eq!(active[0].start, 0x1000);
        assert_eq!(active[0].end, 0x1010);

        let deactive = danger_ranges(&funcs, Mode::Deactive);
        assert_eq!(deactive[0].start, 0x7f0000);
        assert_eq!(deactive[0].end, 0x7f0020);
    }

    #[test]
    fn in_any_range_matches_closed_interval() {
        let ranges = danger_ranges(&[(0x1000, 0x10, 0, 0)], Mode::Active);
        assert_eq!(in_any_range(0x1000, &ranges), Some(0));
        assert_eq!(in_any_range(0x100f, &ranges), Some(0));
        assert_eq!(in_any_range(0x1010, &ranges), Some(0));
        assert_eq!(in_any_range(0x1011, &ranges), None);
    }
}
