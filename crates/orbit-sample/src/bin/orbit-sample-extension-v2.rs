//! Second generation of the sample extension, with a 64-bit `add`.

use std::process::ExitCode;

fn main() -> ExitCode {
    orbit_sample::run(orbit_sample::exports_v2())
}
