pub mod history;

use std::time::Instant;

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame,
};
use unicode_width::UnicodeWidthStr;

use crate::app::{App, View};
use crate::round::{Control, Phase};
use crate::store::KvStore;
use crate::voting::{Candidate, VOTES_TO_WIN};

const HORIZONTAL_MARGIN: u16 = 2;
const VERTICAL_MARGIN: u16 = 1;

pub const LEGEND: &str =
    "(g)enerate / (i)mages / (1)(2) vote / (h)istory / (o)pen image / (R)eset / (esc)ape";

pub fn draw<S: KvStore>(app: &App<S>, f: &mut Frame, now: Instant) {
    match app.view {
        View::Round => render_round(app, f, now),
        View::History => history::render_history(app, f),
    }
}

/// Label shown on a candidate's vote control
pub fn vote_label(candidate: Candidate, votes: u32, physical: bool) -> String {
    if physical {
        format!("Physical Button {candidate}: ({votes}/{VOTES_TO_WIN} votes)")
    } else {
        format!("Choose Variant {candidate} ({votes}/{VOTES_TO_WIN} votes)")
    }
}

fn control_span(key: char, control: &Control) -> Vec<Span<'static>> {
    let style = if control.enabled {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default().add_modifier(Modifier::DIM)
    };
    vec![
        Span::styled(format!("[{key}] "), Style::default().fg(Color::DarkGray)),
        Span::styled(control.label.clone(), style),
        Span::raw("   "),
    ]
}

/// Lines a string needs when wrapped at `width`
fn wrapped_height(text: &str, width: u16) -> u16 {
    let width = width.max(1) as usize;
    let rows: usize = text
        .lines()
        .map(|l| l.width().max(1).div_ceil(width))
        .fold(0, usize::saturating_add);
    rows.clamp(1, u16::MAX as usize) as u16
}

fn render_round<S: KvStore>(app: &App<S>, f: &mut Frame, now: Instant) {
    let machine = &app.machine;
    let controls = machine.controls();
    let round = machine.round();
    let area = f.area();

    let bold_style = Style::default().add_modifier(Modifier::BOLD);
    let dim_italic_style = Style::default().add_modifier(Modifier::DIM | Modifier::ITALIC);

    let inner_width = area.width.saturating_sub(HORIZONTAL_MARGIN * 2);
    let prompt = machine.current_prompt();
    let prompt_height = wrapped_height(&prompt, inner_width).min(4);
    let reflection_height = round
        .reflection
        .as_deref()
        .map(|r| wrapped_height(r, inner_width.saturating_sub(2)).min(6) + 2)
        .unwrap_or(0);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(HORIZONTAL_MARGIN)
        .vertical_margin(VERTICAL_MARGIN)
        .constraints(
            [
                Constraint::Length(1),                 // current image
                Constraint::Length(prompt_height),     // seed prompt
                Constraint::Length(1),                 // padding
                Constraint::Length(1),                 // controls
                Constraint::Min(4),                    // candidates
                Constraint::Length(reflection_height), // reflection
                Constraint::Length(2),                 // status
                Constraint::Length(1),                 // legend
            ]
            .as_ref(),
        )
        .split(area);

    let image = Paragraph::new(Line::from(vec![
        Span::styled("Current image: ", dim_italic_style),
        Span::styled(machine.current_image(), bold_style),
    ]));
    f.render_widget(image, chunks[0]);

    let prompt = Paragraph::new(Span::styled(prompt, dim_italic_style)).wrap(Wrap { trim: true });
    f.render_widget(prompt, chunks[1]);

    let mut control_spans = control_span('g', &controls.start);
    if controls.images.visible {
        control_spans.extend(control_span('i', &controls.images));
    }
    f.render_widget(Paragraph::new(Line::from(control_spans)), chunks[3]);

    if controls.voting_visible || round.texts.iter().any(Option::is_some) {
        render_candidates(app, f, chunks[4], now);
    } else if machine.phase() == Phase::VariantsPending {
        let waiting = Paragraph::new(Span::styled("Generating variants...", dim_italic_style))
            .alignment(Alignment::Center);
        f.render_widget(waiting, chunks[4]);
    }

    if let Some(reflection) = round.reflection.as_deref() {
        let block = Paragraph::new(reflection.to_string())
            .block(Block::default().borders(Borders::ALL).title("Reflection:"))
            .wrap(Wrap { trim: true });
        f.render_widget(block, chunks[5]);
    }

    let mut status_lines = Vec::new();
    if let Some(announcement) = machine.announcement() {
        status_lines.push(Line::from(Span::styled(
            format!("🎉 {announcement}"),
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )));
    } else if let Some(error) = app.error.as_deref() {
        status_lines.push(Line::from(Span::styled(
            error.to_string(),
            Style::default().fg(Color::Red),
        )));
    } else if let Some(status) = machine.status() {
        let color = if machine.buttons().is_enabled() {
            Color::Green
        } else {
            Color::Yellow
        };
        status_lines.push(Line::from(Span::styled(
            status.to_string(),
            Style::default().fg(color),
        )));
    }
    if let Some(count) = machine.instruction_count() {
        status_lines.push(Line::from(Span::styled(
            format!("Instructions pool: {count}"),
            Style::default().add_modifier(Modifier::DIM),
        )));
    }
    f.render_widget(
        Paragraph::new(status_lines).alignment(Alignment::Center),
        chunks[6],
    );

    let legend = Paragraph::new(Span::styled(
        LEGEND,
        Style::default().add_modifier(Modifier::ITALIC),
    ));
    f.render_widget(legend, chunks[7]);
}

fn render_candidates<S: KvStore>(app: &App<S>, f: &mut Frame, area: Rect, now: Instant) {
    let machine = &app.machine;
    let round = machine.round();
    let tally = machine.tally();
    let physical = machine.buttons().is_enabled();
    let winner = match machine.phase() {
        Phase::WinnerSelected(c) => Some(c),
        _ => None,
    };
    let flashing = app.flashing(now);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(area);

    for candidate in Candidate::ALL {
        let column = columns[candidate.index()];
        let border_style = if winner == Some(candidate) {
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
        } else if flashing == Some(candidate) {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(border_style)
            .title(format!("Variant {candidate}"));
        let inner = block.inner(column);
        f.render_widget(block, column);

        let show_gauge = machine.controls().voting_visible;
        let parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints(
                [
                    Constraint::Length(1),
                    Constraint::Min(1),
                    Constraint::Length(if show_gauge { 1 } else { 0 }),
                ]
                .as_ref(),
            )
            .split(inner);

        let image = round.image(candidate).unwrap_or("(no image yet)");
        f.render_widget(
            Paragraph::new(Span::styled(
                image.to_string(),
                Style::default().fg(Color::Blue).add_modifier(Modifier::UNDERLINED),
            )),
            parts[0],
        );

        let text = round.text(candidate).unwrap_or_default();
        f.render_widget(
            Paragraph::new(text.to_string()).wrap(Wrap { trim: true }),
            parts[1],
        );

        if show_gauge {
            let votes = tally.get(candidate);
            let mut gauge_style = Style::default().fg(if physical {
                Color::Cyan
            } else {
                Color::Green
            });
            if !machine.controls().digital_votes_enabled && !physical {
                gauge_style = gauge_style.add_modifier(Modifier::DIM);
            }
            let gauge = Gauge::default()
                .gauge_style(gauge_style)
                .ratio(tally.progress(candidate))
                .label(vote_label(candidate, votes, physical));
            f.render_widget(gauge, parts[2]);
        }
    }
}
