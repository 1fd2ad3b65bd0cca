use clap::Parser;
use talkback_protocol::UserId;

#[derive(Debug, Parser)]
#[command(name = "talkback")]
#[command(about = "Talk to a realtime voice assistant from the terminal", long_about = None)]
pub struct Cli {
    /// Backend user to bill the session to
    #[arg(short, long)]
    pub user_id: UserId,

    /// Assistant voice for this session (overrides the profile)
    #[arg(long)]
    pub voice: Option<String>,

    /// Save this model to the user's profile before connecting
    #[arg(long)]
    pub model: Option<String>,

    /// Save this system prompt to the user's profile before connecting
    #[arg(long)]
    pub prompt_id: Option<i64>,

    /// Backend base URL (overrides TALKBACK_API_URL)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Print the token balance and exit
    #[arg(long)]
    pub balance: bool,
}
