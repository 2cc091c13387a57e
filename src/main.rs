use std::panic;
use std::process;

use svtq_cli::run;

fn main() -> anyhow::Result<()> {
  let orig_hook = panic::take_hook();
  // Catch panics in encoder/decoder worker threads so a single panic can't
  // leave the process hanging with in-flight permits held.
  panic::set_hook(Box::new(move |panic_info| {
    orig_hook(panic_info);
    process::exit(1);
  }));
  run()
}
