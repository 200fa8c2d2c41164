//! End-of-run console summary.

use std::fmt::Write as _;

use crate::orchestrator::RunResult;
use crate::runner::INTERRUPTED_EXIT_CODE;

/// Prints a summary of the run to stderr.
///
/// Stdout belongs to the test command, so nothing is written there.
pub fn print_summary(result: &RunResult) {
    eprint!("{}", render_summary(result));
}

/// Builds the summary text printed by [`print_summary`].
pub fn render_summary(result: &RunResult) -> String {
    let mut out = String::new();

    let _ = writeln!(out);
    let _ = writeln!(out, "Summary:");
    let _ = writeln!(out, "  Services: {}", result.services);

    for report in &result.teardown {
        if report.is_clean() {
            let _ = writeln!(
                out,
                "    {} {}",
                console::style("removed").for_stderr().green(),
                report.service
            );
            continue;
        }

        let _ = writeln!(
            out,
            "    {} {}",
            console::style("warning").for_stderr().yellow(),
            report.service
        );
        if let Some(e) = &report.post_run_error {
            let _ = writeln!(out, "      {}", e);
        }
        for e in &report.errors {
            let _ = writeln!(out, "      {}", console::style(e).for_stderr().red());
        }
    }

    let _ = writeln!(out, "  Duration: {:.2?}", result.duration);
    let _ = writeln!(out);

    let status = if result.success() {
        console::style("Tests passed.".to_string()).for_stderr().green().bold()
    } else if result.exit_code() == INTERRUPTED_EXIT_CODE {
        console::style("Interrupted.".to_string()).for_stderr().yellow().bold()
    } else {
        console::style(format!("Tests failed (exit code {}).", result.exit_code()))
            .for_stderr()
            .red()
            .bold()
    };
    let _ = writeln!(out, "{}", status);

    out
}
