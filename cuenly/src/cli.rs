//! The process's command-line surface: one-shot email processing, and
//! leader-elected scheduler control.

use argh::FromArgs;

#[derive(FromArgs, Debug)]
/// Multi-tenant invoice email ingestion pipeline.
pub struct Args {
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Process(ProcessArgs),
    StartJob(StartJobArgs),
    StopJob(StopJobArgs),
    Status(StatusArgs),
    Worker(WorkerArgs),
}

/// Runs a single ingestion sweep across all configured mailboxes, then exits.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "process")]
pub struct ProcessArgs {
    /// restrict the sweep to this owner's mailbox only
    #[argh(option)]
    pub owner: Option<String>,
}

/// Enables the periodic scheduler and attempts to claim leadership.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "start-job")]
pub struct StartJobArgs {}

/// Disables the scheduler and releases leadership globally.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "stop-job")]
pub struct StopJobArgs {}

/// Prints the scheduler's current enabled/owner state.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "status")]
pub struct StatusArgs {}

/// Dequeues and runs `process_account_job`s enqueued by the fan-out until
/// interrupted with ctrl-c.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "worker")]
pub struct WorkerArgs {}
