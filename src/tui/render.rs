use std::borrow::Cow;

use super::state::AppState;
use super::View;
use crate::scheduler::RunState;
use crate::store::{ActionKind, ActionOutcome};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};

const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

pub fn draw(f: &mut Frame, state: &AppState, view: &View, spinner_frame: u8) {
    if view.log_focus {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(f.area());

        draw_header(f, state, chunks[0], spinner_frame);
        draw_logs(f, state, view, chunks[1]);
        draw_footer(f, view, chunks[2]);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(TASK_ROWS + 3),
            Constraint::Length(6),
            Constraint::Min(6),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, state, chunks[0], spinner_frame);
    draw_tasks(f, state, view, chunks[1]);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[2]);
    draw_targets(f, state, middle[0]);
    draw_quotas(f, state, middle[1]);

    draw_actions(f, state, chunks[3]);
    draw_logs(f, state, view, chunks[4]);
    draw_footer(f, view, chunks[5]);
}

const TASK_ROWS: u16 = 6;

fn draw_header(f: &mut Frame, state: &AppState, area: Rect, spinner_frame: u8) {
    let activity = match state.run_state {
        RunState::Paused => Span::styled(
            " PAUSED",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
        RunState::Stopping => Span::styled(
            " STOPPING",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
        RunState::Running => {
            let ch = SPINNER_FRAMES[(spinner_frame as usize) % SPINNER_FRAMES.len()];
            Span::styled(format!(" {} RUN", ch), Style::default().fg(Color::Cyan))
        }
    };

    let device = match (&state.suspended, &state.device) {
        (Some(reason), _) => Span::styled(
            format!("SUSPENDED ({})", truncate_with_ellipsis(reason, 40)),
            Style::default().fg(Color::Red),
        ),
        (None, Some(dev)) => Span::styled(dev.clone(), Style::default().fg(Color::Green)),
        (None, None) => Span::styled("not attached", Style::default().fg(Color::DarkGray)),
    };

    let mut spans = vec![
        Span::raw(" Device: "),
        device,
        Span::raw(format!(
            " | Targets: {} | Up: {}",
            state.total_targets(),
            state.uptime()
        )),
        activity,
    ];
    if !state.warnings.is_empty() {
        spans.push(Span::styled(
            format!("  ! {}", state.warnings.join("; ")),
            Style::default().fg(Color::Yellow),
        ));
    }

    let (title, title_style) = if state.sim_mode {
        (
            " follow-cycle [SIMULATION] ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )
    } else {
        (" follow-cycle ", Style::default())
    };

    let block = Block::default()
        .title(Span::styled(title, title_style))
        .borders(Borders::ALL);
    f.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn draw_tasks(f: &mut Frame, state: &AppState, view: &View, area: Rect) {
    let header = Row::new(vec!["Task", "Cadence", "On", "Last run", "Next", "Status"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let status_w = area.width.saturating_sub(2 + 20 + 10 + 3 + 9 + 9 + 6) as usize;

    let rows: Vec<Row> = state
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let (text, color) = match (&t.error, &t.status) {
                (Some(e), _) => (format!("failed: {}", e), Color::Red),
                (None, Some(s)) if s.starts_with("deferred") => (s.clone(), Color::Yellow),
                (None, Some(s)) if s.starts_with("skipped") => (s.clone(), Color::DarkGray),
                (None, Some(s)) => (s.clone(), Color::Green),
                (None, None) => ("--".to_string(), Color::DarkGray),
            };
            let on = if t.enabled {
                Cell::from("on").style(Style::default().fg(Color::Green))
            } else {
                Cell::from("off").style(Style::default().fg(Color::DarkGray))
            };
            let row = Row::new(vec![
                Cell::from(t.name.clone()),
                Cell::from(t.cadence.clone()),
                on,
                Cell::from(t.last_run.clone().unwrap_or_else(|| "--".to_string())),
                Cell::from(t.next_eligible.clone()),
                Cell::from(truncate_with_ellipsis(&text, status_w).into_owned())
                    .style(Style::default().fg(color)),
            ]);
            if i == view.selected {
                row.style(Style::default().add_modifier(Modifier::REVERSED))
            } else {
                row
            }
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(20),
            Constraint::Length(10),
            Constraint::Length(3),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(Block::default().title(" Tasks ").borders(Borders::ALL));
    f.render_widget(table, area);
}

fn draw_targets(f: &mut Frame, state: &AppState, area: Rect) {
    let lines: Vec<Line> = state
        .targets
        .iter()
        .map(|(s, n)| {
            Line::from(vec![
                Span::styled(format!(" {:<20}", s.as_str()), Style::default().fg(Color::DarkGray)),
                Span::raw(n.to_string()),
            ])
        })
        .collect();
    let block = Block::default().title(" Targets ").borders(Borders::ALL);
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_quotas(f: &mut Frame, state: &AppState, area: Rect) {
    let header = Row::new(vec!["Kind", "Hour", "Day", "Rolling 1h/24h", "Day resets"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = state
        .quotas
        .iter()
        .map(|q| {
            let color = if q.hour_used >= q.hour_cap || q.day_used >= q.day_cap {
                Color::Red
            } else if q.hour_used * 5 >= q.hour_cap * 4 {
                Color::Yellow
            } else {
                Color::Green
            };
            Row::new(vec![
                Cell::from(q.kind.to_string()),
                Cell::from(format!("{}/{}", q.hour_used, q.hour_cap))
                    .style(Style::default().fg(color)),
                Cell::from(format!("{}/{}", q.day_used, q.day_cap))
                    .style(Style::default().fg(color)),
                Cell::from(format!("{}/{}", q.rolling_hour, q.rolling_day)),
                Cell::from(
                    q.day_resets_at
                        .with_timezone(&chrono::Local)
                        .format("%H:%M")
                        .to_string(),
                ),
            ])
        })
        .collect();
    let table = Table::new(
        rows,
        [
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(15),
            Constraint::Min(6),
        ],
    )
    .header(header)
    .block(Block::default().title(" Quotas ").borders(Borders::ALL));
    f.render_widget(table, area);
}

fn draw_actions(f: &mut Frame, state: &AppState, area: Rect) {
    let visible = area.height.saturating_sub(3) as usize;
    let handle_w = area.width.saturating_sub(2 + 9 + 9 + 10 + 8 + 10) as usize / 2;

    let header = Row::new(vec!["Time", "Kind", "Handle", "Outcome", "Latency", "Detail"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = state
        .actions
        .iter()
        .take(visible)
        .map(|a| {
            let outcome_color = match a.outcome {
                ActionOutcome::Success => Color::Green,
                ActionOutcome::NotFound => Color::Yellow,
                ActionOutcome::Error => Color::Red,
            };
            let kind_color = if a.kind == ActionKind::Unfollow.as_str() {
                Color::Magenta
            } else {
                Color::Reset
            };
            Row::new(vec![
                Cell::from(a.time.clone()),
                Cell::from(a.kind.clone()).style(Style::default().fg(kind_color)),
                Cell::from(truncate_with_ellipsis(&a.handle, handle_w).into_owned()),
                Cell::from(a.outcome.as_str()).style(Style::default().fg(outcome_color)),
                Cell::from(format!("{}ms", a.latency_ms)),
                Cell::from(a.detail.clone().unwrap_or_default()),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(handle_w as u16),
            Constraint::Length(10),
            Constraint::Length(8),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(Block::default().title(" Recent Actions ").borders(Borders::ALL));
    f.render_widget(table, area);
}

fn draw_logs(f: &mut Frame, state: &AppState, view: &View, area: Rect) {
    let max_width = area.width.saturating_sub(2) as usize; // borders
    let visible_lines = area.height.saturating_sub(2) as usize;

    let total = state.logs.len();
    let offset = if view.log_focus {
        view.log_scroll.min(total.saturating_sub(visible_lines))
    } else {
        0
    };

    let lines: Vec<Line> = state
        .logs
        .iter()
        .rev()
        .skip(offset)
        .take(visible_lines)
        .map(|l| {
            let color = match l.level.as_str() {
                "ERROR" => Color::Red,
                "WARN" => Color::Yellow,
                "TASK" => Color::Cyan,
                _ => Color::DarkGray,
            };
            let prefix = format!(" {} [{}] ", l.time, l.level);
            let msg_max = max_width.saturating_sub(prefix.len());
            let msg = truncate_with_ellipsis(&l.message, msg_max);
            Line::from(vec![
                Span::styled(prefix, Style::default().fg(color)),
                Span::raw(msg.into_owned()),
            ])
        })
        .collect();

    let title = if view.log_focus {
        format!(" Log [{}/{} lines] ", offset + visible_lines.min(total), total)
    } else {
        " Log ".to_string()
    };

    let block = Block::default().title(title).borders(Borders::ALL);
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_footer(f: &mut Frame, view: &View, area: Rect) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow));
    let line = if view.log_focus {
        Line::from(vec![
            key("  [Esc]"),
            Span::raw(" back  "),
            key("[j/k]"),
            Span::raw(" scroll  "),
            key("[g/G]"),
            Span::raw(" top/bottom  "),
        ])
    } else {
        Line::from(vec![
            key("  [q]"),
            Span::raw("uit  "),
            key("[p]"),
            Span::raw("ause  "),
            key("[c]"),
            Span::raw("ontinue  "),
            key("[\u{2191}/\u{2193}]"),
            Span::raw(" select  "),
            key("[r]"),
            Span::raw("un now  "),
            key("[t]"),
            Span::raw("oggle  "),
            key("[l]"),
            Span::raw("ogs  "),
        ])
    };
    f.render_widget(Paragraph::new(line), area);
}

fn truncate_with_ellipsis(s: &str, max_width: usize) -> Cow<'_, str> {
    let char_count = s.chars().count();
    if char_count <= max_width {
        Cow::Borrowed(s)
    } else if max_width <= 3 {
        Cow::Owned(".".repeat(max_width))
    } else {
        let end = s
            .char_indices()
            .nth(max_width - 3)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        Cow::Owned(format!("{}...", &s[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_short_strings() {
        assert_eq!(truncate_with_ellipsis("alice", 10), "alice");
        assert_eq!(truncate_with_ellipsis("a_very_long_handle", 8), "a_ver...");
        assert_eq!(truncate_with_ellipsis("handle", 2), "..");
    }
}
