//! First generation of the sample extension.

use std::process::ExitCode;

fn main() -> ExitCode {
    orbit_sample::run(orbit_sample::exports())
}
