use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "soundcron", version, about = "Scheduled sound playback for Discord voice channels")]
pub struct Cli {
    /// Config file (default: ~/.soundcron/soundcron.toml)
    #[arg(long, global = true, env = "SOUNDCRON_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the poller: claim due occurrences and enqueue them.
    Bot {
        /// Log jobs instead of writing them to Redis.
        #[arg(long)]
        dry_run: bool,
    },
    /// Consume jobs and play them in voice channels.
    Worker {
        /// Log preload and playback instead of fetching audio and joining voice.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create a SoundCron.
    Add {
        #[arg(long)]
        guild_id: String,
        #[arg(long)]
        name: String,
        /// Five-field cron expression or @macro, e.g. "*/5 * * * *".
        #[arg(long)]
        cron: String,
        /// Size of the uploaded audio in bytes, counted against the guild quota.
        #[arg(long, default_value_t = 0)]
        file_size: i64,
    },
    /// List a guild's SoundCrons, most recently accessed first.
    List {
        #[arg(long)]
        guild_id: String,
    },
    /// Delete a SoundCron and blacklist its queued occurrences.
    Delete {
        #[arg(long)]
        id: String,
    },
}
