use crate::app::AppContext;
use crate::calendar::{CalendarGrid, CellClass, GridView};
use crate::config::Config;
use crate::dates::{self, WEEKDAY_HEADINGS};
use crate::ui;
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;

pub fn tui(config: Config) -> Result<()> {
    let ctx = AppContext::build(config)?;
    ui::run(&ctx)
}

pub fn login(config: Config, user: String) -> Result<()> {
    let ctx = AppContext::build(config)?;
    let identity = ctx.auth.login(&user)?;
    println!("Signed in as {}", identity.user_id);
    Ok(())
}

pub fn logout(config: Config) -> Result<()> {
    let ctx = AppContext::build(config)?;
    ctx.auth.logout()?;
    println!("Signed out");
    Ok(())
}

pub fn whoami(config: Config) -> Result<()> {
    let ctx = AppContext::build(config)?;
    match ctx.auth.current() {
        Some(identity) => println!("{}", identity.user_id),
        None => println!("(signed out)"),
    }
    Ok(())
}

pub fn show(config: Config, date: Option<String>) -> Result<()> {
    let date = parse_date_arg(date.as_deref())?;
    let ctx = signed_in_context(config)?;
    let key = dates::short_key(date);
    println!("{}", dates::pretty_label(date));
    match ctx.sync.note(&key) {
        Some(text) => println!("{}", text),
        None => println!("(no note)"),
    }
    Ok(())
}

pub fn set(config: Config, date: String, text: String) -> Result<()> {
    let date = parse_date_arg(Some(&date))?;
    let ctx = signed_in_context(config)?;
    let key = dates::short_key(date);
    ctx.runtime
        .block_on(ctx.sync.save(&key, &text))
        .with_context(|| format!("saving note for {}", key))?;
    if text.is_empty() {
        println!("Cleared {}", key);
    } else {
        println!("Saved {}", key);
    }
    Ok(())
}

pub fn list(config: Config) -> Result<()> {
    let ctx = signed_in_context(config)?;
    let notes = ctx.sync.notes();
    if notes.is_empty() {
        println!("(no notes)");
    }
    for (key, text) in notes {
        let first_line = text.lines().next().unwrap_or_default();
        println!("{}  {}", key, first_line);
    }
    Ok(())
}

pub fn month(config: Config, date: Option<String>) -> Result<()> {
    let date = parse_date_arg(date.as_deref())?;
    let ctx = AppContext::build(config)?;
    ctx.start_session().context("loading notes")?;
    let mut grid = CalendarGrid::new(date);
    grid.mark_starred(ctx.sync.notes().into_iter().map(|(key, _)| key));
    grid.refresh();
    print!("{}", format_grid(grid.view()));
    Ok(())
}

pub fn show_config(config: Config) -> Result<()> {
    let serialized = serde_yaml::to_string(&config).context("serializing config")?;
    print!("{}", serialized);
    Ok(())
}

fn signed_in_context(config: Config) -> Result<AppContext> {
    let ctx = AppContext::build(config)?;
    ctx.start_session().context("loading notes")?;
    if ctx.sync.identity().is_none() {
        bail!("not signed in; run `calnotes login <user>` first");
    }
    Ok(ctx)
}

fn parse_date_arg(input: Option<&str>) -> Result<NaiveDate> {
    let raw = match input {
        Some(r) => r.trim(),
        None => return Ok(dates::today()),
    };
    let offset = match raw {
        "" | "today" => 0,
        "yesterday" => -1,
        "tomorrow" => 1,
        _ => return Ok(dates::parse_short_key(raw)?),
    };
    dates::add_days(dates::today(), offset).ok_or_else(|| anyhow!("date out of range: {}", raw))
}

/// Plain-text month grid. Markers: `[d]` today, `<d>` chosen, `d*` has a
/// note, `.d` outside the month.
fn format_grid(view: &GridView) -> String {
    let mut out = format!("{:^35}\n", view.title);
    for heading in WEEKDAY_HEADINGS {
        out.push_str(&format!("{:^5}", heading));
    }
    out.push('\n');
    for week in view.weeks() {
        for cell in week {
            let text = match cell.class {
                CellClass::OutOfMonth => format!(".{}", cell.label),
                CellClass::Today => format!("[{}]", cell.label),
                CellClass::Selected => format!("<{}>", cell.label),
                CellClass::Starred => format!("{}*", cell.label),
                CellClass::Plain => cell.label.clone(),
            };
            out.push_str(&format!("{:^5}", text));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keywords_and_short_keys() {
        assert_eq!(parse_date_arg(None).unwrap(), dates::today());
        assert_eq!(
            parse_date_arg(Some("tomorrow")).unwrap(),
            dates::add_days(dates::today(), 1).unwrap()
        );
        assert_eq!(
            parse_date_arg(Some("2025-07-15")).unwrap(),
            NaiveDate::from_ymd_opt(2025, 7, 15).unwrap()
        );
        assert!(parse_date_arg(Some("15/07/2025")).is_err());
    }

    #[test]
    fn grid_text_marks_each_class() {
        let reference = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 7, 10).unwrap();
        let mut grid = CalendarGrid::with_clock(reference, Box::new(move || today));
        grid.mark_starred(["2025-07-20".to_string()]);
        grid.refresh();
        let text = format_grid(grid.view());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0].trim(), "July 2025");
        assert!(lines[2].contains(".30"));
        assert!(text.contains("[10]"));
        assert!(text.contains("<15>"));
        assert!(text.contains("20*"));
        assert!(lines[7].contains(".10"));
    }
}
