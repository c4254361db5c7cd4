use clap::{Parser, Subcommand};
use colored::Colorize;

use patscan::config::{ScanConfig, DEFAULT_CHUNK_SIZE};
use patscan::findings::ScanReport;
use patscan::job::ScanEvent;
use patscan::pattern;
use patscan::session::Session;

#[derive(Parser)]
#[command(
    name = "patscan",
    version,
    about = "Cyclic pattern generator and overflow offset finder"
)]
struct Cli {
    /// Log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Bytes read from the target per request
    #[arg(long, global = true, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Skip writable ranges larger than this many bytes (decimal or 0x-hex)
    #[arg(long, global = true, value_parser = parse_size)]
    max_range: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a cyclic pattern of the given length
    Create { length: usize },

    /// Find the offset of a value in the pattern.
    ///
    /// `0x41306141` is read as hex. Bare text such as `Aa0A` or `Ab0Ab1Ab` is
    /// looked up literally first, then as hex if it is all hex digits.
    Offset { value: String },

    /// Attach to a process, search registers and writable memory, print the report
    Search {
        #[arg(short, long)]
        pid: i32,
    },

    /// Attach to a process and open an interactive prompt
    Attach { pid: i32 },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = ScanConfig::default()
        .with_chunk_size(cli.chunk_size)
        .with_max_range_len(cli.max_range);
    let session = Session::new(config)?;

    match cli.command {
        Command::Create { length } => cmd_create(&session, length),
        Command::Offset { value } => cmd_offset(&session, &value),
        Command::Search { pid } => cmd_search(session, pid),
        Command::Attach { pid } => cmd_attach(session, pid),
    }
}

#[cfg(target_os = "linux")]
fn cmd_search(session: Session, pid: i32) -> anyhow::Result<()> {
    linux::search_once(session, pid)
}

#[cfg(target_os = "linux")]
fn cmd_attach(session: Session, pid: i32) -> anyhow::Result<()> {
    linux::run(session, pid)
}

#[cfg(not(target_os = "linux"))]
fn cmd_search(_session: Session, _pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("searching a live process requires Linux (ptrace)")
}

#[cfg(not(target_os = "linux"))]
fn cmd_attach(_session: Session, _pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("attaching requires Linux (ptrace)")
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn parse_size(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid size '{}': {}", s, e))
}

fn cmd_create(session: &Session, length: usize) -> anyhow::Result<()> {
    let bytes = session.create(length)?;
    println!("{}", String::from_utf8_lossy(bytes));
    Ok(())
}

fn cmd_offset(session: &Session, value: &str) -> anyhow::Result<()> {
    match find_offset(session, value)? {
        Some(offset) => {
            println!(
                "  pattern offset: {} (0x{:x})",
                offset.to_string().bold(),
                offset
            );
        }
        None => {
            println!("  {}", "pattern not found".yellow());
        }
    }
    Ok(())
}

fn find_offset(session: &Session, value: &str) -> anyhow::Result<Option<usize>> {
    let query = pattern::parse_query(value)?;
    Ok(session.lookup(&query))
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::Register(hit) => println!(
            "  {} {} offset {}",
            "register".bold(),
            hit.name.cyan(),
            hit.offset.to_string().bold()
        ),
        ScanEvent::RangeStarted(range) => {
            println!("  {} to {}", range.start, range.end)
        }
        ScanEvent::RangeSkipped { range, reason } => {
            println!("  {} {}: {}", "skipped".yellow(), range, reason)
        }
        ScanEvent::Finding(f) => println!(
            "  {} {} offset {}",
            "found".green(),
            format!("0x{:x}", f.address.addr()).cyan(),
            f.offset.to_string().bold()
        ),
        ScanEvent::Done(state) => println!("  search {}", state),
        ScanEvent::RangeFinished { .. } | ScanEvent::Unreadable { .. } => {}
    }
}

fn print_report(report: &ScanReport) {
    if report.is_empty() {
        println!("{}", report.render().yellow());
    } else {
        println!("{}", report.render());
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use crossbeam_channel::Receiver;
    use colored::Colorize;
    use rustyline::DefaultEditor;

    use patscan::job::ScanEvent;
    use patscan::procfs::RangeSet;
    use patscan::scan;
    use patscan::session::Session;
    use patscan::target::Target;

    use super::{cmd_create, cmd_offset, print_event, print_report};

    /// Attach, search, print everything, detach.
    pub fn search_once(mut session: Session, pid: i32) -> anyhow::Result<()> {
        let target = Target::attach(nix::unistd::Pid::from_raw(pid))?;
        println!("{} searching process {}", "patscan".bold().cyan(), pid);

        let events = target.search(&mut session)?;
        for event in events.iter() {
            print_event(&event);
        }
        if let Some(report) = session.wait() {
            print_report(&report);
        }
        Ok(())
    }

    struct Repl {
        session: Session,
        target: Target,
        events: Option<Receiver<ScanEvent>>,
    }

    pub fn run(session: Session, pid: i32) -> anyhow::Result<()> {
        let target = Target::attach(nix::unistd::Pid::from_raw(pid))?;
        println!(
            "{} attached to process {}",
            "patscan".bold().cyan(),
            target.pid()
        );

        let mut repl = Repl {
            session,
            target,
            events: None,
        };
        let mut rl = DefaultEditor::new()?;

        loop {
            repl.drain_events();

            let prompt = format!("{} ", "patscan>".bold().green());
            let line = match rl.readline(&prompt) {
                Ok(line) => line,
                Err(
                    rustyline::error::ReadlineError::Interrupted
                    | rustyline::error::ReadlineError::Eof,
                ) => {
                    break;
                }
                Err(e) => {
                    eprintln!("readline error: {}", e);
                    break;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rl.add_history_entry(line)?;

            let parts: Vec<&str> = line.split_whitespace().collect();
            let cmd = parts[0];
            let args = &parts[1..];

            if matches!(cmd, "quit" | "q") {
                break;
            }
            if let Err(e) = repl.handle_command(cmd, args) {
                eprintln!("{}: {}", "error".red(), e);
            }
        }

        if let Some(report) = repl.session.cancel() {
            print_report(&report);
        }
        Ok(())
    }

    impl Repl {
        fn handle_command(&mut self, cmd: &str, args: &[&str]) -> anyhow::Result<()> {
            match cmd {
                "pattern" | "pat" => self.cmd_pattern(args),
                "search" | "s" => self.cmd_search(),
                "status" | "st" => self.cmd_status(),
                "wait" | "w" => self.cmd_wait(),
                "cancel" | "c" => self.cmd_cancel(),
                "results" | "res" => self.cmd_results(),
                "register" | "reg" | "r" => self.cmd_registers(),
                "maps" | "m" => self.cmd_maps(),
                "help" | "h" => cmd_help(),
                _ => {
                    println!(
                        "unknown command: {}. Type 'help' for available commands.",
                        cmd
                    );
                    Ok(())
                }
            }
        }

        /// Print whatever the worker produced since the last prompt.
        fn drain_events(&mut self) {
            if let Some(rx) = &self.events {
                for event in rx.try_iter() {
                    if matches!(event, ScanEvent::Finding(_) | ScanEvent::Done(_)) {
                        print_event(&event);
                    }
                }
            }
            if let Some(report) = self.session.poll() {
                self.events = None;
                print_report(&report);
            }
        }

        fn cmd_pattern(&mut self, args: &[&str]) -> anyhow::Result<()> {
            match args.first().copied() {
                Some("create") | Some("c") => match args.get(1) {
                    Some(len) => {
                        let length: usize = len
                            .parse()
                            .map_err(|_| anyhow::anyhow!("invalid length: {}", len))?;
                        cmd_create(&self.session, length)
                    }
                    None => {
                        println!("usage: pattern create <length>");
                        Ok(())
                    }
                },
                Some("offset") | Some("o") => match args.get(1) {
                    Some(value) => cmd_offset(&self.session, value),
                    None => {
                        println!("usage: pattern offset <value>");
                        println!("  e.g.: pattern offset 0x41306141");
                        Ok(())
                    }
                },
                None => {
                    println!("usage: pattern create <length>");
                    println!("       pattern offset <value>");
                    Ok(())
                }
                Some(sub) => {
                    println!("unknown pattern subcommand: {}", sub);
                    Ok(())
                }
            }
        }

        fn cmd_search(&mut self) -> anyhow::Result<()> {
            if let Some(report) = self.session.cancel() {
                println!("  {}", "restarting running search".yellow());
                self.drain_channel();
                print_report(&report);
            }
            let events = self.target.search(&mut self.session)?;
            self.events = Some(events);
            println!("  search started in the background ('status', 'wait', 'cancel')");
            Ok(())
        }

        fn cmd_status(&mut self) -> anyhow::Result<()> {
            self.drain_events();
            println!("  search: {}", self.session.state().to_string().bold());
            if self.session.is_searching() {
                println!("  ('wait' blocks until done, 'cancel' stops it)");
            }
            Ok(())
        }

        fn cmd_wait(&mut self) -> anyhow::Result<()> {
            match self.session.wait() {
                Some(report) => {
                    self.drain_channel();
                    print_report(&report);
                }
                None => println!("  no search running"),
            }
            Ok(())
        }

        fn cmd_cancel(&mut self) -> anyhow::Result<()> {
            match self.session.cancel() {
                Some(report) => {
                    self.drain_channel();
                    print_report(&report);
                }
                None => println!("  no search running"),
            }
            Ok(())
        }

        fn cmd_results(&mut self) -> anyhow::Result<()> {
            match self.session.last_report() {
                Some(report) => print_report(report),
                None => println!("  no finished search"),
            }
            Ok(())
        }

        fn cmd_registers(&mut self) -> anyhow::Result<()> {
            let snapshot = self.target.register_snapshot()?;
            let hits = scan::scan_registers(&snapshot, self.session.codec());
            for (name, value) in &snapshot {
                let hit = hits.iter().find(|h| &h.name == name);
                let value_str = format!("0x{:016x}", value);
                match hit {
                    Some(h) => println!(
                        "  {:>4} = {}  pattern offset {}",
                        name.bold(),
                        value_str.red(),
                        h.offset.to_string().bold()
                    ),
                    None => println!("  {:>4} = {}", name.bold(), value_str.cyan()),
                }
            }
            Ok(())
        }

        fn cmd_maps(&mut self) -> anyhow::Result<()> {
            let regions = self.target.memory_maps()?;
            let mut ranges = RangeSet::new();
            for region in regions.iter().filter(|r| r.range().writable) {
                ranges.insert(region.start, region.end);
                println!(
                    "  {}-{} {} {}",
                    format!("{:016x}", region.start.addr()).cyan(),
                    format!("{:016x}", region.end.addr()).cyan(),
                    region.perms,
                    region.pathname
                );
            }
            println!(
                "  {} writable range(s), {} bytes",
                ranges.len(),
                ranges.total_bytes()
            );
            Ok(())
        }

        /// Print the tail of a finished search's event stream.
        fn drain_channel(&mut self) {
            if let Some(rx) = self.events.take() {
                for event in rx.try_iter() {
                    if matches!(event, ScanEvent::Finding(_)) {
                        print_event(&event);
                    }
                }
            }
        }
    }

    fn cmd_help() -> anyhow::Result<()> {
        println!("{}", "Commands:".bold());
        println!(
            "  {} (pat)           pattern create <len> | pattern offset <value>",
            "pattern".bold()
        );
        println!(
            "  {} (s)              search registers and writable memory in the background",
            "search".bold()
        );
        println!("  {} (st)             show search state", "status".bold());
        println!("  {} (w)                wait for the search to finish", "wait".bold());
        println!("  {} (c)              stop the running search", "cancel".bold());
        println!("  {} (res)           show the last report", "results".bold());
        println!(
            "  {} (reg)          registers, with pattern offsets",
            "register".bold()
        );
        println!("  {} (m)                writable mappings", "maps".bold());
        println!("  {} (h)                this help", "help".bold());
        println!("  {} (q)                detach and exit", "quit".bold());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_hex_and_decimal() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x1000"), Ok(4096));
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn cli_parses_offset() {
        let cli = Cli::try_parse_from(["patscan", "-vv", "offset", "0x41306141"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Offset { ref value } if value == "0x41306141"));
    }

    #[test]
    fn offset_accepts_crash_dump_text() {
        let session = Session::new(ScanConfig::default()).unwrap();
        assert_eq!(find_offset(&session, "0x41306141").unwrap(), Some(0));
        assert_eq!(find_offset(&session, "Aa0A").unwrap(), Some(0));
        assert_eq!(find_offset(&session, "Ab0Ab1Ab").unwrap(), Some(30));
        assert_eq!(find_offset(&session, "nowhere").unwrap(), None);
        assert!(find_offset(&session, "0xzz").is_err());
    }

    #[test]
    fn cli_global_scan_flags() {
        let cli = Cli::try_parse_from([
            "patscan",
            "create",
            "100",
            "--chunk-size",
            "8192",
            "--max-range",
            "0x100000",
        ])
        .unwrap();
        assert_eq!(cli.chunk_size, 8192);
        assert_eq!(cli.max_range, Some(0x100000));
        assert!(matches!(cli.command, Command::Create { length: 100 }));
    }
}
