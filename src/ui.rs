use crate::app::AppContext;
use crate::auth::Identity;
use crate::calendar::{CalendarGrid, CellClass, DaySelected};
use crate::dates::{self, WEEKDAY_HEADINGS};
use crate::prefs::{DEBUG, THEME};
use crate::sync::{StarredSnapshot, SyncError, SyncEvent};
use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::prelude::{Alignment, Color, Modifier, Rect, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::Terminal;
use std::io::{stdout, Stdout};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

const CELL_WIDTH: u16 = 5;
const FLASH_FOR: Duration = Duration::from_millis(900);

pub fn run(ctx: &AppContext) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut app = App::new(ctx);
    // Subscribed before the watcher starts so the first load is not missed.
    ctx.spawn_auth_watch();
    let result = app.event_loop(&mut terminal);
    teardown_terminal(&mut terminal)?;
    result
}

struct App<'a> {
    ctx: &'a AppContext,
    calendar: CalendarGrid,
    selections: UnboundedReceiver<DaySelected>,
    sync_events: UnboundedReceiver<SyncEvent>,
    applied_seq: u64,
    open_key: String,
    editor: FieldValue,
    /// Text the editor was last loaded with.
    editor_base: String,
    mode: Mode,
    identity: Option<Identity>,
    status: String,
    flash: Option<(FlashKind, Instant)>,
    theme: Theme,
    debug: bool,
    show_help: bool,
    last_save: Option<Instant>,
    calendar_inner: Rect,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mode {
    Browse,
    Editing,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum FlashKind {
    Success,
    Failure,
    Info,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Theme {
    Night,
    Paper,
    Dusk,
}

struct Palette {
    background: Color,
    text: Color,
    dim: Color,
    accent: Color,
    today: Style,
    selected: Style,
    starred: Style,
}

impl Theme {
    fn from_name(name: &str) -> Self {
        match name {
            "paper" => Theme::Paper,
            "dusk" => Theme::Dusk,
            _ => Theme::Night,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Theme::Night => "night",
            Theme::Paper => "paper",
            Theme::Dusk => "dusk",
        }
    }

    fn next(&self) -> Self {
        match self {
            Theme::Night => Theme::Paper,
            Theme::Paper => Theme::Dusk,
            Theme::Dusk => Theme::Night,
        }
    }

    fn palette(&self) -> Palette {
        match self {
            Theme::Night => Palette {
                background: Color::Rgb(16, 18, 24),
                text: Color::Gray,
                dim: Color::DarkGray,
                accent: Color::Cyan,
                today: Style::default()
                    .bg(Color::LightRed)
                    .fg(Color::Black)
                    .add_modifier(Modifier::BOLD),
                selected: Style::default()
                    .bg(Color::Cyan)
                    .fg(Color::Black)
                    .add_modifier(Modifier::BOLD),
                starred: Style::default()
                    .fg(Color::LightYellow)
                    .add_modifier(Modifier::BOLD),
            },
            Theme::Paper => Palette {
                background: Color::Rgb(238, 232, 213),
                text: Color::Black,
                dim: Color::Gray,
                accent: Color::Blue,
                today: Style::default()
                    .bg(Color::Red)
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
                selected: Style::default()
                    .bg(Color::Blue)
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
                starred: Style::default()
                    .fg(Color::Magenta)
                    .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
            },
            Theme::Dusk => Palette {
                background: Color::Rgb(40, 28, 48),
                text: Color::LightMagenta,
                dim: Color::DarkGray,
                accent: Color::LightMagenta,
                today: Style::default()
                    .bg(Color::Yellow)
                    .fg(Color::Black)
                    .add_modifier(Modifier::BOLD),
                selected: Style::default()
                    .bg(Color::LightMagenta)
                    .fg(Color::Black)
                    .add_modifier(Modifier::BOLD),
                starred: Style::default()
                    .fg(Color::LightGreen)
                    .add_modifier(Modifier::BOLD),
            },
        }
    }
}

impl Palette {
    fn cell_style(&self, class: CellClass) -> Style {
        match class {
            CellClass::OutOfMonth => Style::default().fg(self.dim).add_modifier(Modifier::DIM),
            CellClass::Today => self.today,
            CellClass::Selected => self.selected,
            CellClass::Starred => self.starred,
            CellClass::Plain => Style::default().fg(self.text),
        }
    }
}

#[derive(Clone)]
struct FieldValue {
    value: String,
    cursor: usize,
}

impl FieldValue {
    fn new(value: &str) -> Self {
        FieldValue {
            value: value.to_string(),
            cursor: value.len(),
        }
    }

    fn move_left(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor = prev_char(self.cursor, &self.value);
    }

    fn move_right(&mut self) {
        if self.cursor >= self.value.len() {
            return;
        }
        self.cursor = next_char(self.cursor, &self.value);
    }

    fn move_up(&mut self) {
        let (line_starts, line_idx, col) = line_state(&self.value, self.cursor);
        if line_idx == 0 {
            return;
        }
        let target_start = line_starts[line_idx - 1];
        self.cursor = index_at_col(&self.value, target_start, col);
    }

    fn move_down(&mut self) {
        let (line_starts, line_idx, col) = line_state(&self.value, self.cursor);
        if line_idx + 1 >= line_starts.len() {
            return;
        }
        let target_start = line_starts[line_idx + 1];
        self.cursor = index_at_col(&self.value, target_start, col);
    }

    fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let prev = prev_char(self.cursor, &self.value);
        self.value.drain(prev..self.cursor);
        self.cursor = prev;
    }

    fn insert_char(&mut self, ch: char) {
        self.value.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    fn with_caret(&self) -> String {
        let mut text = self.value.clone();
        text.insert_str(self.cursor, "▌");
        text
    }
}

impl<'a> App<'a> {
    fn new(ctx: &'a AppContext) -> Self {
        let today = dates::today();
        let mut calendar = CalendarGrid::new(today);
        let selections = calendar.subscribe();
        let sync_events = ctx.sync.subscribe();
        let (theme, debug) = match ctx.prefs.lock() {
            Ok(prefs) => (
                Theme::from_name(prefs.get(THEME).unwrap_or_default()),
                prefs.get_bool(DEBUG),
            ),
            Err(_) => (Theme::Night, false),
        };
        let open_key = dates::short_key(today);
        let stored = ctx.sync.note(&open_key).unwrap_or_default();
        App {
            ctx,
            calendar,
            selections,
            sync_events,
            applied_seq: 0,
            editor: FieldValue::new(&stored),
            editor_base: stored,
            open_key,
            mode: Mode::Browse,
            identity: ctx.sync.identity(),
            status: "Loading notes...".into(),
            flash: None,
            theme,
            debug,
            show_help: false,
            last_save: None,
            calendar_inner: Rect::default(),
        }
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        loop {
            self.drain_events();
            terminal.draw(|f| self.draw(f))?;
            if event::poll(Duration::from_millis(100))? {
                match event::read()? {
                    Event::Key(key) => {
                        if key.kind != KeyEventKind::Press {
                            continue;
                        }
                        if self.handle_key(key)? {
                            break;
                        }
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(selected) = self.selections.try_recv() {
            self.open_day(selected.date);
        }
        while let Ok(event) = self.sync_events.try_recv() {
            self.handle_sync_event(event);
        }
        // Leaving the editor on sign-out happens when `SignedOut` arrives.
        self.identity = self.ctx.sync.identity();
    }

    fn handle_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Saved { key, snapshot } => {
                self.apply_snapshot(snapshot);
                if key == self.open_key {
                    self.editor_base = self.ctx.sync.note(&key).unwrap_or_default();
                }
                self.last_save = Some(Instant::now());
                self.signal(FlashKind::Success, format!("Saved {}", key));
            }
            SyncEvent::SaveFailed { key, error } => {
                let message = match error {
                    SyncError::Unauthenticated | SyncError::NotLoaded => {
                        format!("Save refused for {}: {}", key, error)
                    }
                    _ => format!("Save failed for {} (kept locally): {}", key, error),
                };
                self.signal(FlashKind::Failure, message);
            }
            SyncEvent::Loaded { merged, snapshot } => {
                self.apply_snapshot(snapshot);
                if self.mode == Mode::Browse {
                    self.reload_editor();
                }
                self.signal(
                    FlashKind::Success,
                    format!("Loaded notes ({} updated)", merged),
                );
            }
            SyncEvent::Empty => {
                self.signal(FlashKind::Info, "No saved notes yet");
            }
            SyncEvent::LoadFailed { error } => {
                self.signal(
                    FlashKind::Failure,
                    format!("Load failed (r to retry): {}", error),
                );
            }
            SyncEvent::SignedOut { snapshot } => {
                self.apply_snapshot(snapshot);
                let discarded =
                    self.mode == Mode::Editing && self.editor.value != self.editor_base;
                self.mode = Mode::Browse;
                self.reload_editor();
                if discarded {
                    self.signal(FlashKind::Info, "Signed out; unsaved edit discarded");
                } else {
                    self.signal(FlashKind::Info, "Signed out");
                }
            }
        }
    }

    /// Snapshots older than the last one applied are ignored.
    fn apply_snapshot(&mut self, snapshot: StarredSnapshot) {
        if snapshot.seq <= self.applied_seq {
            return;
        }
        self.applied_seq = snapshot.seq;
        self.calendar.set_starred(snapshot.keys);
        self.calendar.refresh();
    }

    fn signal(&mut self, kind: FlashKind, message: impl Into<String>) {
        self.status = message.into();
        self.flash = Some((kind, Instant::now()));
    }

    fn open_day(&mut self, date: NaiveDate) {
        self.open_key = dates::short_key(date);
        self.reload_editor();
    }

    fn reload_editor(&mut self) {
        self.editor_base = self.ctx.sync.note(&self.open_key).unwrap_or_default();
        self.editor = FieldValue::new(&self.editor_base);
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        let control = key.modifiers.contains(KeyModifiers::CONTROL);
        let alt = key.modifiers.contains(KeyModifiers::ALT);
        if self.show_help {
            self.show_help = false;
            return Ok(false);
        }
        match key.code {
            KeyCode::Char('s') if control && !alt => {
                self.save();
                return Ok(false);
            }
            KeyCode::Char('d') if control && alt => {
                self.toggle_debug();
                return Ok(false);
            }
            KeyCode::Char('n') if control && alt => {
                self.ctx.sync.log_dump();
                self.signal(FlashKind::Info, "Dumped notes to the log");
                return Ok(false);
            }
            _ => {}
        }
        match self.mode {
            Mode::Browse => self.handle_browse_key(key),
            Mode::Editing => {
                self.handle_edit_key(key);
                Ok(false)
            }
        }
    }

    fn handle_browse_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Left | KeyCode::Char('h') => self.step(-1),
            KeyCode::Right | KeyCode::Char('l') => self.step(1),
            KeyCode::Up | KeyCode::Char('k') => self.step(-7),
            KeyCode::Down | KeyCode::Char('j') => self.step(7),
            KeyCode::Char('[') => self.calendar.navigate(-1),
            KeyCode::Char(']') => self.calendar.navigate(1),
            KeyCode::Char('{') => self.calendar.navigate(-12),
            KeyCode::Char('}') => self.calendar.navigate(12),
            KeyCode::Char('t') => self.calendar.reset_to_today(),
            KeyCode::Enter | KeyCode::Char('i') => self.start_editing(),
            KeyCode::Char('r') => self.reload(),
            KeyCode::Char('L') => self.login(),
            KeyCode::Char('O') => self.logout(),
            KeyCode::Char('T') => self.cycle_theme(),
            KeyCode::Char('?') => self.show_help = true,
            _ => {}
        }
        Ok(false)
    }

    fn handle_edit_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                let stored = self.ctx.sync.note(&self.open_key).unwrap_or_default();
                if stored != self.editor.value {
                    self.reload_editor();
                    self.signal(FlashKind::Info, "Unsaved edit discarded");
                } else {
                    self.status = "Browsing".into();
                }
                self.mode = Mode::Browse;
            }
            KeyCode::Left => self.editor.move_left(),
            KeyCode::Right => self.editor.move_right(),
            KeyCode::Up => self.editor.move_up(),
            KeyCode::Down => self.editor.move_down(),
            KeyCode::Enter => self.editor.insert_char('\n'),
            KeyCode::Backspace => self.editor.backspace(),
            KeyCode::Char(c) => {
                if !key
                    .modifiers
                    .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT)
                {
                    self.editor.insert_char(c);
                }
            }
            _ => {}
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Middle) => self.cycle_theme(),
            MouseEventKind::Down(MouseButton::Left) if self.mode == Mode::Browse => {
                let area = self.calendar_inner;
                if mouse.column < area.x
                    || mouse.row < area.y
                    || mouse.column >= area.x + area.width
                {
                    return;
                }
                let row = mouse.row - area.y;
                let col = (mouse.column - area.x) / CELL_WIDTH;
                if row == 0 {
                    self.calendar.reset_to_today();
                } else if (2..8).contains(&row) && col < 7 {
                    let index = usize::from(row - 2) * 7 + usize::from(col);
                    self.calendar.select_cell(index);
                }
            }
            _ => {}
        }
    }

    /// Arrow movement. When the chosen day is not on screen (after month
    /// navigation), the first press lands on the 1st of the displayed month.
    fn step(&mut self, days: i64) {
        let chosen = self.calendar.chosen_date();
        let displayed = self.calendar.displayed_month();
        let on_screen =
            chosen.year() == displayed.year() && chosen.month() == displayed.month();
        if on_screen {
            self.calendar.move_chosen(days);
        } else {
            self.calendar
                .select_day(dates::first_of_month(displayed), None);
        }
    }

    /// Editing and saving need a session whose notes have been loaded.
    fn ready_to_edit(&mut self, action: &str) -> bool {
        if self.identity.is_none() {
            self.signal(FlashKind::Failure, format!("Sign in to {} notes (L)", action));
            return false;
        }
        if !self.ctx.sync.is_loaded() {
            self.signal(
                FlashKind::Failure,
                format!("Notes not loaded yet; press r to retry before you {}", action),
            );
            return false;
        }
        true
    }

    fn start_editing(&mut self) {
        if !self.ready_to_edit("edit") {
            return;
        }
        self.mode = Mode::Editing;
        self.status = format!(
            "Editing {} (Ctrl+S save, Esc done)",
            dates::pretty_label(self.calendar.chosen_date())
        );
    }

    fn save(&mut self) {
        if !self.ready_to_edit("save") {
            return;
        }
        let text = if self.editor.value.trim().is_empty() {
            String::new()
        } else {
            self.editor.value.clone()
        };
        let key = self.open_key.clone();
        let sync = self.ctx.sync.clone();
        self.status = format!("Saving {}...", key);
        self.ctx.runtime.spawn(async move {
            // Outcome arrives as a sync event.
            let _ = sync.save(&key, &text).await;
        });
    }

    fn reload(&mut self) {
        if self.identity.is_none() {
            self.signal(FlashKind::Failure, "Sign in to load notes (L)");
            return;
        }
        let sync = self.ctx.sync.clone();
        self.status = "Loading notes...".into();
        self.ctx.runtime.spawn(async move {
            let _ = sync.load().await;
        });
    }

    fn login(&mut self) {
        if self.identity.is_some() {
            self.signal(FlashKind::Info, "Already signed in");
            return;
        }
        let Some(user) = self.ctx.auth.remembered_user() else {
            self.signal(
                FlashKind::Failure,
                "No remembered user; run `calnotes login <user>`",
            );
            return;
        };
        match self.ctx.auth.login(&user) {
            Ok(identity) => self.status = format!("Signing in as {}...", identity.user_id),
            Err(err) => self.signal(FlashKind::Failure, format!("Login failed: {}", err)),
        }
    }

    fn logout(&mut self) {
        if let Err(err) = self.ctx.auth.logout() {
            self.signal(FlashKind::Failure, format!("Logout failed: {}", err));
        }
    }

    fn cycle_theme(&mut self) {
        self.theme = self.theme.next();
        self.persist_pref(THEME, self.theme.name());
        self.status = format!("Theme {}", self.theme.name());
    }

    fn toggle_debug(&mut self) {
        self.debug = !self.debug;
        self.persist_pref(DEBUG, if self.debug { "true" } else { "false" });
        self.status = format!("Debug {}", if self.debug { "on" } else { "off" });
    }

    fn persist_pref(&mut self, key: &str, value: &str) {
        let result = match self.ctx.prefs.lock() {
            Ok(mut prefs) => prefs.set(key, value),
            Err(_) => Err(anyhow::anyhow!("preferences lock poisoned")),
        };
        if let Err(err) = result {
            tracing::warn!(event = "pref_write_failed", key, error = %err);
        }
    }

    fn draw(&mut self, f: &mut ratatui::Frame<'_>) {
        let palette = self.theme.palette();
        f.render_widget(
            Block::default().style(Style::default().bg(palette.background)),
            f.size(),
        );
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(10),
                Constraint::Length(if self.debug { 5 } else { 4 }),
            ])
            .split(f.size());

        self.draw_header(f, layout[0], &palette);
        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(CELL_WIDTH * 7 + 2), Constraint::Min(20)])
            .split(layout[1]);
        self.draw_calendar(f, body[0], &palette);
        self.draw_editor(f, body[1], &palette);
        self.draw_footer(f, layout[2], &palette);

        if self.show_help {
            self.draw_help(f, &palette);
        }
    }

    fn draw_header(&self, f: &mut ratatui::Frame<'_>, area: Rect, palette: &Palette) {
        let who = match &self.identity {
            Some(identity) => Span::styled(
                identity.user_id.clone(),
                Style::default().fg(Color::Green),
            ),
            None => Span::styled("signed out", Style::default().fg(Color::LightRed)),
        };
        let saved = match self.last_save {
            Some(at) => format!("saved {}", format_elapsed(at)),
            None => "not saved this session".to_string(),
        };
        let title = Line::from(vec![
            Span::styled(
                "calnotes ",
                Style::default()
                    .fg(palette.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                dates::pretty_label(self.calendar.chosen_date()),
                Style::default().fg(palette.text).add_modifier(Modifier::BOLD),
            ),
            Span::raw("  •  "),
            who,
            Span::raw("  •  "),
            Span::styled(saved, Style::default().fg(palette.dim)),
        ]);
        let block = Block::default()
            .borders(Borders::BOTTOM)
            .border_style(Style::default().fg(palette.dim));
        let paragraph = Paragraph::new(title)
            .alignment(Alignment::Center)
            .block(block);
        f.render_widget(paragraph, area);
    }

    fn draw_calendar(&mut self, f: &mut ratatui::Frame<'_>, area: Rect, palette: &Palette) {
        let view = self.calendar.view();
        let mut lines = Vec::new();
        lines.push(Line::from(Span::styled(
            format!("{:^width$}", view.title, width = usize::from(CELL_WIDTH * 7)),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )));
        let headings: Vec<Span<'static>> = WEEKDAY_HEADINGS
            .iter()
            .map(|h| {
                Span::styled(
                    format!("{:^width$}", h, width = usize::from(CELL_WIDTH)),
                    Style::default().fg(palette.dim),
                )
            })
            .collect();
        lines.push(Line::from(headings));
        for week in view.weeks() {
            let spans: Vec<Span<'static>> = week
                .iter()
                .map(|cell| {
                    Span::styled(
                        format!("{:^width$}", cell.label, width = usize::from(CELL_WIDTH)),
                        palette.cell_style(cell.class),
                    )
                })
                .collect();
            lines.push(Line::from(spans));
        }

        let focused = self.mode == Mode::Browse;
        let block = Block::default()
            .title(Span::styled(
                "Calendar",
                Style::default()
                    .fg(if focused { palette.accent } else { palette.dim })
                    .add_modifier(Modifier::BOLD),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if focused {
                palette.accent
            } else {
                palette.dim
            }));
        self.calendar_inner = block.inner(area);
        let paragraph = Paragraph::new(lines).block(block);
        f.render_widget(paragraph, area);
    }

    fn draw_editor(&self, f: &mut ratatui::Frame<'_>, area: Rect, palette: &Palette) {
        let editing = self.mode == Mode::Editing;
        let starred = self.calendar.is_starred(&self.open_key);
        let title = format!(
            "Note {}{}",
            self.open_key,
            if starred { " *" } else { "" }
        );
        let content: Vec<Line<'static>> = if self.identity.is_none() {
            vec![Line::from(Span::styled(
                "Signed out. Press L to sign in again, or run `calnotes login <user>`.",
                Style::default().fg(palette.dim),
            ))]
        } else {
            let text = if editing {
                self.editor.with_caret()
            } else if self.editor.value.is_empty() {
                String::new()
            } else {
                self.editor.value.clone()
            };
            if text.is_empty() {
                vec![Line::from(Span::styled(
                    "(empty, press Enter to write)",
                    Style::default().fg(palette.dim),
                ))]
            } else {
                text.split('\n')
                    .map(|line| {
                        Line::from(Span::styled(
                            line.to_string(),
                            Style::default().fg(if editing { palette.accent } else { palette.text }),
                        ))
                    })
                    .collect()
            }
        };
        let block = Block::default()
            .title(Span::styled(
                title,
                Style::default()
                    .fg(if editing { palette.accent } else { palette.dim })
                    .add_modifier(Modifier::BOLD),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if editing {
                palette.accent
            } else {
                palette.dim
            }));
        let paragraph = Paragraph::new(content)
            .wrap(Wrap { trim: false })
            .block(block);
        f.render_widget(paragraph, area);
    }

    fn draw_footer(&self, f: &mut ratatui::Frame<'_>, area: Rect, palette: &Palette) {
        let mut constraints = vec![Constraint::Length(2), Constraint::Length(2)];
        if self.debug {
            constraints.push(Constraint::Length(1));
        }
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(area);

        let help_bar = Paragraph::new(self.footer_help_line())
            .alignment(Alignment::Center)
            .block(
                Block::default()
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(palette.dim)),
            );
        f.render_widget(help_bar, rows[0]);

        let flash_color = match self.flash {
            Some((kind, at)) if at.elapsed() < FLASH_FOR => match kind {
                FlashKind::Success => Some(Color::LightGreen),
                FlashKind::Failure => Some(Color::LightRed),
                FlashKind::Info => Some(Color::LightBlue),
            },
            _ => None,
        };
        let status_style = match flash_color {
            Some(color) => Style::default().fg(Color::Black).bg(color),
            None => Style::default().fg(palette.text),
        };
        let status = Paragraph::new(Span::styled(self.status.clone(), status_style))
            .wrap(Wrap { trim: true })
            .block(
                Block::default()
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(flash_color.unwrap_or(palette.dim))),
            );
        f.render_widget(status, rows[1]);

        if self.debug {
            let debug = Paragraph::new(format!(
                "seq={} starred={} notes={} displayed={} chosen={} theme={}",
                self.applied_seq,
                self.calendar.starred().len(),
                self.ctx.sync.notes().len(),
                dates::short_key(self.calendar.displayed_month()),
                dates::short_key(self.calendar.chosen_date()),
                self.theme.name(),
            ))
            .style(Style::default().fg(palette.dim));
            f.render_widget(debug, rows[2]);
        }
    }

    fn footer_help_line(&self) -> Line<'static> {
        let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::LightCyan));
        match self.mode {
            Mode::Browse => Line::from(vec![
                key("←↑↓→ / h j k l"),
                Span::raw(" day  "),
                key("[ ]"),
                Span::raw(" month  "),
                key("t"),
                Span::raw(" today  "),
                key("Enter"),
                Span::raw(" edit  "),
                key("Ctrl+S"),
                Span::raw(" save  "),
                key("?"),
                Span::raw(" help  "),
                Span::styled("q", Style::default().fg(Color::LightRed)),
                Span::raw(" quit"),
            ]),
            Mode::Editing => Line::from(vec![
                key("Ctrl+S"),
                Span::raw(" save  "),
                key("Esc"),
                Span::raw(" done  "),
                key("Enter"),
                Span::raw(" newline"),
            ]),
        }
    }

    fn draw_help(&self, f: &mut ratatui::Frame<'_>, palette: &Palette) {
        let area = centered_rect(60, 60, f.size());
        let rows = [
            ("←↑↓→ / h j k l", "move the chosen day"),
            ("[ ]  { }", "previous/next month, previous/next year"),
            ("t / click title", "back to the current month"),
            ("click a day", "choose that day"),
            ("Enter / i", "edit the note"),
            ("Ctrl+S", "save (empty note deletes it)"),
            ("r", "load notes again"),
            ("L / O", "sign in as remembered user / sign out"),
            ("T / middle click", "cycle theme"),
            ("Ctrl+Alt+D", "toggle debug line"),
            ("Ctrl+Alt+N", "dump notes to the log"),
        ];
        let lines: Vec<Line<'static>> = rows
            .iter()
            .map(|(k, what)| {
                Line::from(vec![
                    Span::styled(
                        format!("{:<18}", k),
                        Style::default().fg(Color::LightCyan),
                    ),
                    Span::raw(what.to_string()),
                ])
            })
            .collect();
        let dialog = Paragraph::new(lines).block(
            Block::default()
                .title(Span::styled(
                    "Keys",
                    Style::default()
                        .fg(palette.accent)
                        .add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(palette.accent)),
        );
        f.render_widget(Clear, area);
        f.render_widget(dialog, area);
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn teardown_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        DisableMouseCapture,
        LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn prev_char(cursor: usize, text: &str) -> usize {
    if cursor == 0 {
        return 0;
    }
    let mut prev = 0;
    for (idx, _) in text.char_indices() {
        if idx >= cursor {
            break;
        }
        prev = idx;
    }
    prev
}

fn next_char(cursor: usize, text: &str) -> usize {
    for (idx, ch) in text.char_indices() {
        if idx > cursor {
            return idx;
        }
        if idx == cursor {
            return cursor + ch.len_utf8();
        }
    }
    text.len()
}

/// Line start offsets, the caret's line index, and its column in chars.
fn line_state(text: &str, cursor: usize) -> (Vec<usize>, usize, usize) {
    let mut starts = vec![0];
    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            starts.push(idx + 1);
        }
    }
    let line_idx = starts
        .iter()
        .rposition(|start| *start <= cursor)
        .unwrap_or(0);
    let col = text[starts[line_idx]..cursor].chars().count();
    (starts, line_idx, col)
}

fn index_at_col(text: &str, start: usize, target_col: usize) -> usize {
    let slice = &text[start..];
    let limit = slice.find('\n').unwrap_or(slice.len());
    slice[..limit]
        .char_indices()
        .nth(target_col)
        .map(|(idx, _)| start + idx)
        .unwrap_or(start + limit)
}

fn format_elapsed(last: Instant) -> String {
    let secs = last.elapsed().as_secs();
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context_in(dir: &tempfile::TempDir) -> AppContext {
        AppContext::build(Config::rooted(
            &dir.path().join("data"),
            &dir.path().join("cache"),
            &dir.path().join("config"),
        ))
        .unwrap()
    }

    fn signed_in_context(dir: &tempfile::TempDir) -> AppContext {
        let ctx = context_in(dir);
        ctx.auth.login("alice").unwrap();
        ctx.start_session().unwrap();
        ctx
    }

    fn snapshot(seq: u64, keys: &[&str]) -> StarredSnapshot {
        StarredSnapshot {
            seq,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn starred(app: &App<'_>) -> Vec<String> {
        app.calendar.starred().iter().cloned().collect()
    }

    #[test]
    fn older_snapshots_never_replace_newer_ones() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = signed_in_context(&dir);
        let mut app = App::new(&ctx);

        app.handle_sync_event(SyncEvent::Saved {
            key: "2025-07-02".into(),
            snapshot: snapshot(5, &["2025-07-01", "2025-07-02"]),
        });
        app.handle_sync_event(SyncEvent::Loaded {
            merged: 1,
            snapshot: snapshot(3, &["2025-07-01"]),
        });
        assert_eq!(starred(&app), vec!["2025-07-01", "2025-07-02"]);
        assert_eq!(app.applied_seq, 5);

        app.handle_sync_event(SyncEvent::SignedOut {
            snapshot: snapshot(6, &[]),
        });
        assert!(starred(&app).is_empty());
        assert_eq!(app.applied_seq, 6);
    }

    #[test]
    fn loaded_notes_refresh_the_editor_only_while_browsing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = signed_in_context(&dir);
        let mut app = App::new(&ctx);
        let key = app.open_key.clone();

        ctx.runtime.block_on(ctx.sync.save(&key, "first")).unwrap();
        app.handle_sync_event(SyncEvent::Loaded {
            merged: 1,
            snapshot: ctx.sync.snapshot(),
        });
        assert_eq!(app.editor.value, "first");

        app.start_editing();
        assert!(app.mode == Mode::Editing);
        app.editor.insert_char('!');
        ctx.runtime.block_on(ctx.sync.save(&key, "second")).unwrap();
        app.handle_sync_event(SyncEvent::Loaded {
            merged: 1,
            snapshot: ctx.sync.snapshot(),
        });
        assert_eq!(app.editor.value, "first!");
    }

    #[test]
    fn signing_out_mid_edit_says_the_edit_was_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = signed_in_context(&dir);
        let mut app = App::new(&ctx);
        app.start_editing();
        app.editor.insert_char('x');

        ctx.runtime
            .block_on(ctx.sync.handle_auth_change(None))
            .unwrap();
        app.drain_events();

        assert!(app.mode == Mode::Browse);
        assert_eq!(app.editor.value, "");
        assert!(app.identity.is_none());
        assert!(app.status.contains("unsaved edit discarded"));
    }

    #[test]
    fn lowercase_l_moves_right_and_uppercase_o_signs_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = signed_in_context(&dir);
        let mut app = App::new(&ctx);
        let before = app.calendar.chosen_date();

        app.handle_key(KeyEvent::new(KeyCode::Char('l'), KeyModifiers::NONE))
            .unwrap();
        assert_eq!(
            app.calendar.chosen_date(),
            dates::add_days(before, 1).unwrap()
        );
        assert!(ctx.auth.current().is_some());

        app.handle_key(KeyEvent::new(KeyCode::Char('O'), KeyModifiers::SHIFT))
            .unwrap();
        assert!(ctx.auth.current().is_none());
    }

    #[test]
    fn editing_waits_until_notes_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(&dir);
        let document = ctx
            .config
            .store_dir
            .join("users/alice/apps")
            .join(&ctx.config.app_id)
            .join("documents/notes.json");
        std::fs::create_dir_all(document.parent().unwrap()).unwrap();
        std::fs::write(&document, "not json").unwrap();
        ctx.auth.login("alice").unwrap();
        assert!(ctx.start_session().is_err());

        let mut app = App::new(&ctx);
        assert!(app.identity.is_some());
        app.start_editing();
        assert!(app.mode == Mode::Browse);
        assert!(app.status.contains("not loaded"));
    }

    #[test]
    fn caret_moves_across_lines_by_column() {
        let mut field = FieldValue::new("first line\nab");
        assert_eq!(field.cursor, field.value.len());
        field.move_up();
        assert_eq!(&field.value[..field.cursor], "fi");
        field.move_down();
        assert_eq!(field.cursor, field.value.len());
    }

    #[test]
    fn editing_handles_multibyte_text() {
        let mut field = FieldValue::new("né");
        field.backspace();
        assert_eq!(field.value, "n");
        field.insert_char('ø');
        field.move_left();
        field.insert_char('\n');
        assert_eq!(field.value, "n\nø");
        assert_eq!(field.with_caret(), "n\n▌ø");
    }

    #[test]
    fn themes_cycle_and_round_trip_names() {
        let mut theme = Theme::Night;
        for _ in 0..3 {
            assert_eq!(Theme::from_name(theme.name()), theme);
            theme = theme.next();
        }
        assert_eq!(theme, Theme::Night);
        assert_eq!(Theme::from_name("unknown"), Theme::Night);
    }

    #[test]
    fn today_and_selection_styles_differ() {
        let palette = Theme::Night.palette();
        assert_ne!(
            palette.cell_style(CellClass::Today),
            palette.cell_style(CellClass::Selected)
        );
        assert_ne!(
            palette.cell_style(CellClass::Starred),
            palette.cell_style(CellClass::Plain)
        );
    }
}
