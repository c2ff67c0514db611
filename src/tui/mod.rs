pub mod render;
pub mod state;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::prelude::*;
use state::AppState;
use std::io::stdout;
use std::time::Duration;
use tokio::sync::watch;

/// Commands the TUI can send back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuiCommand {
    Quit,
    Pause,
    Resume,
    RunNow(String),
    ToggleTask(String),
}

/// Local view state; never leaves the TUI.
#[derive(Debug, Default, Clone)]
pub struct View {
    pub selected: usize,
    pub log_focus: bool,
    pub log_scroll: usize,
}

impl View {
    /// Apply one key press. Returns the command for the engine, if any.
    pub fn handle_key(&mut self, code: KeyCode, state: &AppState) -> Option<TuiCommand> {
        if self.log_focus {
            match code {
                KeyCode::Esc | KeyCode::Char('l') => self.log_focus = false,
                KeyCode::Char('j') | KeyCode::Down => {
                    self.log_scroll = self.log_scroll.saturating_sub(1)
                }
                KeyCode::Char('k') | KeyCode::Up => {
                    self.log_scroll = (self.log_scroll + 1).min(state.logs.len().saturating_sub(1))
                }
                KeyCode::Char('g') => self.log_scroll = state.logs.len().saturating_sub(1),
                KeyCode::Char('G') => self.log_scroll = 0,
                KeyCode::Char('q') => return Some(TuiCommand::Quit),
                _ => {}
            }
            return None;
        }

        let selected_name = state.tasks.get(self.selected).map(|t| t.name.clone());
        match code {
            KeyCode::Char('q') => Some(TuiCommand::Quit),
            KeyCode::Char('p') => Some(TuiCommand::Pause),
            KeyCode::Char('c') => Some(TuiCommand::Resume),
            KeyCode::Char('r') => selected_name.map(TuiCommand::RunNow),
            KeyCode::Char('t') => selected_name.map(TuiCommand::ToggleTask),
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < state.tasks.len() {
                    self.selected += 1;
                }
                None
            }
            KeyCode::Char('l') => {
                self.log_focus = true;
                self.log_scroll = 0;
                None
            }
            _ => None,
        }
    }
}

/// Run the TUI. Reads state from `state_rx`, sends commands on `cmd_tx`.
pub async fn run_tui(
    state_rx: watch::Receiver<AppState>,
    cmd_tx: tokio::sync::mpsc::Sender<TuiCommand>,
) -> Result<()> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = tui_loop(&mut terminal, state_rx, cmd_tx).await;

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

async fn tui_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    mut state_rx: watch::Receiver<AppState>,
    cmd_tx: tokio::sync::mpsc::Sender<TuiCommand>,
) -> Result<()> {
    let mut view = View::default();
    let mut spinner_frame: u8 = 0;
    loop {
        let state = state_rx.borrow_and_update().clone();
        terminal.draw(|f| render::draw(f, &state, &view, spinner_frame))?;
        spinner_frame = spinner_frame.wrapping_add(1);

        // Poll for keyboard events with 100ms timeout
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(cmd) = view.handle_key(key.code, &state) {
                        let quit = cmd == TuiCommand::Quit;
                        let _ = cmd_tx.send(cmd).await;
                        if quit {
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Redraw on new state, or at least every 250ms for the spinner
        let _ = tokio::time::timeout(Duration::from_millis(250), state_rx.changed()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::TaskLine;

    fn state_with_tasks(names: &[&str]) -> AppState {
        let mut state = AppState::new(true);
        state.tasks = names
            .iter()
            .map(|n| TaskLine {
                name: n.to_string(),
                cadence: "every 5m".into(),
                enabled: true,
                last_run: None,
                next_eligible: "12:00:00".into(),
                status: None,
                error: None,
            })
            .collect();
        state
    }

    #[test]
    fn test_selection_drives_run_now() {
        let state = state_with_tasks(&["follow_batch", "verify_follow_backs"]);
        let mut view = View::default();
        assert_eq!(view.handle_key(KeyCode::Down, &state), None);
        assert_eq!(view.handle_key(KeyCode::Down, &state), None);
        assert_eq!(view.selected, 1, "selection stops at the last task");
        assert_eq!(
            view.handle_key(KeyCode::Char('r'), &state),
            Some(TuiCommand::RunNow("verify_follow_backs".into()))
        );
        view.handle_key(KeyCode::Up, &state);
        assert_eq!(
            view.handle_key(KeyCode::Char('t'), &state),
            Some(TuiCommand::ToggleTask("follow_batch".into()))
        );
    }

    #[test]
    fn test_log_view_swallows_task_keys() {
        let state = state_with_tasks(&["follow_batch"]);
        let mut view = View::default();
        view.handle_key(KeyCode::Char('l'), &state);
        assert!(view.log_focus);
        assert_eq!(view.handle_key(KeyCode::Char('r'), &state), None);
        view.handle_key(KeyCode::Esc, &state);
        assert!(!view.log_focus);
        assert_eq!(view.handle_key(KeyCode::Char('p'), &state), Some(TuiCommand::Pause));
    }
}
