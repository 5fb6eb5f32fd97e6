//! CLI subcommand implementations.

pub mod keys;
pub mod pack;
pub mod receiver;
pub mod receivers;

use std::process::ExitCode;

/// Prints a transcript verbatim (ensuring a trailing newline) and maps its
/// first line to the process exit code: anything other than `OK …` is a
/// failure.
#[must_use]
pub fn finish_transcript(transcript: &str) -> ExitCode {
    print!("{transcript}");
    if !transcript.ends_with('\n') {
        println!();
    }
    if transcript.starts_with("OK") {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
