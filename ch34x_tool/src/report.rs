//! Console output.

use colored::Colorize;

use ch34x_uart::baud::StageCandidate;
use ch34x_uart::{BaudRateResolver, BaudRateSolution, ChipVersion};

use crate::device::DeviceInfo;
use crate::sender::{Sample, Summary};

const MIB: f64 = 1024.0 * 1024.0;

/// Print every stage evaluated for `target` and mark the winner.
pub fn print_candidates(resolver: &BaudRateResolver, target: u32) {
    println!("{}", format!("Divider search for {} baud", target).bold());
    println!("Reference clock: {} Hz", resolver.clock_hz());
    println!("{}", "-".repeat(60));
    println!(
        "  {:<6} {:>8} {:>8} {:>6} {:>14} {:>10}",
        "stage", "divider", "N", "count", "actual", "error"
    );

    let chosen = resolver.resolve(target);

    for candidate in resolver.candidates(target).iter() {
        println!("{}", format_candidate(candidate, chosen.as_ref().ok()));
    }

    println!("{}", "-".repeat(60));
    match chosen {
        Ok(solution) => println!("  {} {}", "Selected:".green().bold(), solution),
        Err(e) => println!("  {} {}", "No solution:".red().bold(), e),
    }
}

fn format_candidate(candidate: &StageCandidate, chosen: Option<&BaudRateSolution>) -> String {
    let stage = candidate.stage;
    match &candidate.solution {
        Some(solution) => {
            let line = format!(
                "  {:<6} {:>8} {:>8} {:>6} {:>14.2} {:>9.3}%",
                stage.index,
                stage.divider,
                candidate.n,
                candidate.count,
                solution.actual_baud,
                solution.error_percent()
            );
            if chosen.map(|c| c.stage) == Some(stage) {
                line.green().bold().to_string()
            } else {
                line
            }
        }
        None => format!(
            "  {:<6} {:>8} {:>8} {:>6} {:>14} {:>10}",
            stage.index, stage.divider, candidate.n, candidate.count, "-", "out of range"
        )
        .dimmed()
        .to_string(),
    }
}

/// Print the chip's current state as read by `info`.
pub fn print_info(
    info: &DeviceInfo,
    version: ChipVersion,
    baud_regs: [u8; 2],
    lcr_regs: [u8; 2],
    decoded: Option<f64>,
) {
    println!("{}", info.to_string().bold());
    println!("  Chip version:  {}", version);
    println!(
        "  Prescaler:     0x{:02x}  Divisor: 0x{:02x}",
        baud_regs[0], baud_regs[1]
    );
    match decoded {
        Some(baud) => println!("  Baud rate:     {:.2}", baud),
        None => println!("  Baud rate:     {}", "unknown encoding".yellow()),
    }
    println!("  LCR:           0x{:02x}  LCR2:    0x{:02x}", lcr_regs[0], lcr_regs[1]);
}

/// Print a once-per-second progress line.
pub fn print_sample(sample: &Sample) {
    println!(
        "Packets: {}, sent: {:.2} MB, speed: {:.3} KB/s",
        sample.packets,
        sample.total_bytes as f64 / MIB,
        sample.bytes_per_sec / 1024.0
    );
}

/// Print send totals.
pub fn print_summary(summary: &Summary) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "Send Summary".bold());
    println!("{}", "=".repeat(60));
    println!("  Packets sent:  {}", summary.packets.to_string().green());
    println!("  Total data:    {:.4} MB", summary.total_bytes as f64 / MIB);
    println!("  Elapsed:       {:.2} s", summary.elapsed.as_secs_f64());
    println!("  Average speed: {:.3} KB/s", summary.bytes_per_sec / 1024.0);
    if let Some(rate) = summary.last_second_bytes_per_sec {
        println!("  Last second:   {:.3} KB/s", rate / 1024.0);
    }
    println!("{}", "=".repeat(60));
}
