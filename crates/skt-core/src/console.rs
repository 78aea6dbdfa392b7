//! Kernel console log parsing: oops and call trace extraction.

use regex::{Regex, RegexSet};

/// Lines beginning an oops or similar splat.
const OOPS_START: &[&str] = &[
    r"general protection fault:",
    r"BUG:",
    r"kernel BUG at",
    r"do_IRQ: stack overflow:",
    r"RTNL: assertion failed",
    r"Eeek! page_mapcount\(page\) went negative!",
    r"near stack overflow \(cur:",
    r"double fault:",
    r"Badness at",
    r"NETDEV WATCHDOG",
    r"WARNING: at",
    r"appears to be on the same physical disk",
    r"Unable to handle kernel",
    r"sysctl table check failed",
    r"------------\[ cut here \]------------",
    r"list_del corruption\.",
    r"list_add corruption\.",
    r"NMI watchdog: BUG: soft lockup",
    r"irq [0-9]+: nobody cared",
    r"INFO: task .* blocked for more than [0-9]+ seconds",
    r"vmwrite error: reg ",
    r"page allocation failure: order:",
    r"page allocation stalls for.*order:.*mode:",
    r"INFO: rcu_sched self-detected stall on CPU",
    r"INFO: rcu_sched detected stalls on CPUs/tasks:",
    r"NMI watchdog: Watchdog detected hard LOCKUP",
    r"Kernel panic - not syncing: ",
    r"Oops: Unrecoverable TM Unavailable Exception",
];

/// Lines that still belong to a call trace.
const TRACE_CONTINUATION: &[&str] = &[
    r"\[[\d\ \.]+\].*\[[0-9a-f<>]+\]",
    r"\[[\d\ \.]+\]\s+.+\s+[A-Z]\s[0-9a-fx ]+",
    r"\[[\d\ \.]+\]\s+[0-9a-fx ]+",
    r"\[-- MARK --",
    r"Instruction dump",
    r"handlers:",
    r"Code: [0-9a-z]+",
    r"blocked for",
    r"Workqueue:",
    r"disables this message",
    r"Call Trace",
    r"Hardware name",
    r"task: [0-9a-f]+ ti: [0-9a-f]+ task\.ti: [0-9a-f]+",
    r"^(Traceback)?[0-9a-f\s]+$",
    r"(\[[\d\ \.]+\]\s+)?([A-Z0-9]+: [0-9a-fx ]+)+",
    r"Stack:\s*$",
    r"Modules linked in:",
];

/// Lines ending a splat.
const TRACE_END: &[&str] = &[r"\[ end (trace|Kernel panic)"];

/// The part of a console log produced by the kernel under test.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    lines: Vec<String>,
}

impl ConsoleLog {
    /// Keep the log from the `Linux version <krelease>` banner on.
    ///
    /// Without the banner the kernel never started and the log is empty.
    /// Without a release the whole text is kept.
    pub fn parse(text: &str, krelease: Option<&str>) -> Self {
        let kernel_part = match krelease {
            Some(krelease) => {
                let banner = format!("Linux version {krelease}");
                text.find(&banner).map(|start| &text[start..]).unwrap_or("")
            }
            None => text,
        };
        let lines = kernel_part
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Oopses and call traces, in order of appearance.
    pub fn traces(&self) -> Vec<String> {
        let patterns = TracePatterns::new();
        let mut traces = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut in_splat = false;
        let mut in_trace = false;

        for line in &self.lines {
            if patterns.start.is_match(line) {
                in_splat = true;
            } else if line.contains("Call Trace:") {
                in_trace = true;
            }

            let ends = (in_trace && !patterns.continuation.is_match(line))
                || patterns.end.is_match(line);
            if in_splat && ends {
                current.push(line);
                traces.push(current.join("\n"));
                current.clear();
                in_splat = false;
                in_trace = false;
            }

            if in_splat {
                current.push(line);
            }
        }

        if !current.is_empty() {
            traces.push(current.join("\n"));
        }
        traces
    }

    pub fn first_trace(&self) -> Option<String> {
        self.traces().into_iter().next()
    }
}

struct TracePatterns {
    start: RegexSet,
    continuation: RegexSet,
    end: Regex,
}

impl TracePatterns {
    fn new() -> Self {
        Self {
            start: RegexSet::new(OOPS_START).expect("oops patterns are valid"),
            continuation: RegexSet::new(TRACE_CONTINUATION)
                .expect("call trace patterns are valid"),
            end: Regex::new(&TRACE_END.join("|")).expect("trace end patterns are valid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT_OK: &str = "\
SeaBIOS (version 1.11.0)
Booting from ROM...
[    0.000000] Linux version 4.19.0 (builder@host) (gcc version 8.2.1) #1 SMP
[    0.000000] Command line: console=ttyS0
[    1.234567] Run /init as init process
";

    const OOPS: &str = "\
[    0.000000] Linux version 4.19.0 (builder@host) (gcc version 8.2.1) #1 SMP
[    2.000000] BUG: unable to handle kernel NULL pointer dereference at 0000000000000008
[    2.000001] PGD 0 P4D 0
[    2.000002] Oops: 0000 [#1] SMP PTI
[    2.000003] Call Trace:
[    2.000004]  ? do_one_initcall+0x46/0x1c8
[    2.000005]  kernel_init+0xa/0x110
[    2.000006] ---[ end trace 3f2a5b1c9d0e7f64 ]---
[    3.000000] Run /init as init process
";

    #[test]
    fn log_starts_at_kernel_banner() {
        let log = ConsoleLog::parse(BOOT_OK, Some("4.19.0"));
        assert!(log.text().starts_with("Linux version 4.19.0"));
        assert!(!log.text().contains("SeaBIOS"));
    }

    #[test]
    fn missing_banner_means_empty_log() {
        let log = ConsoleLog::parse(BOOT_OK, Some("5.0.0"));
        assert!(log.is_empty());
        assert!(log.traces().is_empty());
    }

    #[test]
    fn clean_boot_has_no_traces() {
        let log = ConsoleLog::parse(BOOT_OK, Some("4.19.0"));
        assert!(log.first_trace().is_none());
    }

    #[test]
    fn oops_with_call_trace_is_extracted() {
        let log = ConsoleLog::parse(OOPS, Some("4.19.0"));
        let traces = log.traces();
        assert_eq!(traces.len(), 1);

        let trace = &traces[0];
        assert!(trace.starts_with("[    2.000000] BUG: unable to handle kernel"));
        assert!(trace.contains("Call Trace:"));
        assert!(trace.contains("kernel_init+0xa/0x110"));
        assert!(trace.ends_with("---[ end trace 3f2a5b1c9d0e7f64 ]---"));
        assert!(!trace.contains("Run /init"));
    }

    #[test]
    fn unterminated_splat_is_still_reported() {
        let text = "Linux version 4.19.0\nKernel panic - not syncing: VFS: Unable to mount root fs\n";
        let traces = ConsoleLog::parse(text, Some("4.19.0")).traces();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].contains("Kernel panic"));
    }

    #[test]
    fn no_release_keeps_everything() {
        let log = ConsoleLog::parse(BOOT_OK, None);
        assert!(log.text().contains("SeaBIOS"));
    }
}
