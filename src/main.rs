mod cli;

use anyhow::Result;
use calnotes::{commands, config, logging};
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = logging::init(&config.log_dir)?;
    let command = args.command.unwrap_or(cli::Command::Tui);
    match command {
        cli::Command::Tui => commands::tui(config),
        cli::Command::Login { user } => commands::login(config, user),
        cli::Command::Logout => commands::logout(config),
        cli::Command::Whoami => commands::whoami(config),
        cli::Command::Show { date } => commands::show(config, date),
        cli::Command::Set { date, text } => commands::set(config, date, text.join(" ")),
        cli::Command::Clear { date } => commands::set(config, date, String::new()),
        cli::Command::List => commands::list(config),
        cli::Command::Month { date } => commands::month(config, date),
        cli::Command::Config => commands::show_config(config),
    }
}
