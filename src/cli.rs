use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "calnotes", version, about = "Calendar day notes in the terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the interactive TUI
    Tui,
    /// Sign in as a user
    Login {
        /// User id that owns the notes document
        user: String,
    },
    /// Sign out
    Logout,
    /// Print the signed-in user
    Whoami,
    /// Print the note for a day
    Show {
        /// YYYY-MM-DD, today, yesterday or tomorrow (defaults to today)
        date: Option<String>,
    },
    /// Save the note for a day (empty text deletes it)
    Set {
        /// YYYY-MM-DD, today, yesterday or tomorrow
        date: String,
        /// Note text
        text: Vec<String>,
    },
    /// Delete the note for a day
    Clear {
        /// YYYY-MM-DD, today, yesterday or tomorrow
        date: String,
    },
    /// List every day that has a note
    List,
    /// Print the month grid around a day
    Month {
        /// YYYY-MM-DD, today, yesterday or tomorrow (defaults to today)
        date: Option<String>,
    },
    /// Print the resolved configuration
    Config,
}
