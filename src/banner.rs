//! Startup banner and system tuning info.

use chrono::Datelike;

use crate::config::COMPANY;

const WEBSITE: &str = "https://novel.sh";
const DOCS_URL: &str = "https://docs.novel.sh/sentinel";

const BANNER: &str = r#"
   _____            __  _            __
  / ___/___  ____  / /_(_)___  ___  / /
  \__ \/ _ \/ __ \/ __/ / __ \/ _ \/ /
 ___/ /  __/ / / / /_/ / / / /  __/ /
/____/\___/_/ /_/\__/_/_/ /_/\___/_/
"#;

/// Print the application banner. Skipped in daemon mode.
pub fn print_banner() {
    eprint!("{}", BANNER);
    eprintln!(
        "\n                        by {} - v{}",
        COMPANY,
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("                Advanced Abuse Detection & Prevention System\n");
    eprintln!("  Website:  {}", WEBSITE);
    eprintln!("  Docs:     {}", DOCS_URL);
    eprintln!("  License:  MIT License");
    eprintln!(
        "\nCopyright © 2025 - {} {} & Contributors\n",
        chrono::Local::now().year(),
        COMPANY
    );
}

/// Print the auto-tuned runtime parameters after startup.
pub fn print_system_info(workers: usize, buffer_size: usize, cpu_count: usize, ram_gb: u64) {
    eprintln!("  System:   {} CPUs, ~{} GB RAM", cpu_count, ram_gb);
    eprintln!(
        "  Tuning:   {} workers, {} event queue slots\n",
        workers, buffer_size
    );
}
