fn main() {
    if let Err(err) = sandbox_orchestrator::cli::run_sandbox_orchestrator() {
        tracing::error!(error = %err, "sandbox-orchestrator failed");
        std::process::exit(1);
    }
}
