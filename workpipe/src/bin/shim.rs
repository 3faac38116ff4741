//! Child process that runs one process-mode stage worker.

fn main() {
    std::process::exit(workpipe::worker::serve());
}
