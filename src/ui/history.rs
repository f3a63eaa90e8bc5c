use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Paragraph, Wrap},
    Frame,
};

use crate::app::App;
use crate::audit::{self, AuditIteration};
use crate::store::KvStore;

pub const HISTORY_LEGEND: &str = "(↑/↓) scroll / (h)ide history / (esc)ape";
pub const EMPTY_HISTORY: &str = "No images generated yet.";

/// Flatten iterations into display lines, newest last
pub fn history_lines(iterations: &[AuditIteration]) -> Vec<Line<'static>> {
    let heading = Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED);
    let label = Style::default().add_modifier(Modifier::DIM);

    let mut lines = Vec::new();
    for iteration in iterations {
        lines.push(Line::from(Span::styled(
            format!("Iteration #{} - {}", iteration.number, iteration.timestamp),
            heading,
        )));
        for variant in &iteration.variants {
            let badge = if variant.chosen {
                Span::styled(
                    "✅ CHOSEN",
                    Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                )
            } else {
                Span::styled("❌ Not chosen", Style::default().fg(Color::Red))
            };
            lines.push(Line::from(vec![
                Span::styled(
                    format!("  Variant {}  ", variant.number),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                badge,
            ]));
            lines.push(Line::from(vec![
                Span::styled("    Prompt: ", label),
                Span::raw(variant.final_prompt.clone()),
            ]));
            lines.push(Line::from(vec![
                Span::styled("    Image:  ", label),
                Span::styled(
                    variant.image_url.clone(),
                    Style::default().fg(Color::Blue),
                ),
            ]));
        }
        lines.push(Line::default());
    }
    lines
}

pub fn render_history<S: KvStore>(app: &App<S>, f: &mut Frame) {
    let entries = app.machine.prompt_history();
    let history = app.machine.history();
    let iterations = audit::iterations(&entries, &history);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(2)
        .vertical_margin(1)
        .constraints(
            [
                Constraint::Length(2),
                Constraint::Min(1),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(f.area());

    let title = Paragraph::new(Span::styled(
        format!("Prompt history ({} iterations)", iterations.len()),
        Style::default().add_modifier(Modifier::BOLD),
    ));
    f.render_widget(title, chunks[0]);

    let body = if iterations.is_empty() {
        Paragraph::new(Span::styled(
            EMPTY_HISTORY,
            Style::default().add_modifier(Modifier::DIM | Modifier::ITALIC),
        ))
    } else {
        Paragraph::new(history_lines(&iterations))
            .wrap(Wrap { trim: false })
            .scroll((app.history_scroll, 0))
    };
    f.render_widget(body, chunks[1]);

    let legend = Paragraph::new(Span::styled(
        HISTORY_LEGEND,
        Style::default().add_modifier(Modifier::ITALIC),
    ));
    f.render_widget(legend, chunks[2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditVariant;

    fn line_text(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn renders_headings_badges_and_payload_verbatim() {
        let iterations = vec![AuditIteration {
            number: 1,
            timestamp: "2026-10-16 09:30:00".into(),
            variants: vec![
                AuditVariant {
                    number: 1,
                    final_prompt: "a red circle, \"bold\" & <bright>".into(),
                    image_url: "https://img/1.png".into(),
                    chosen: true,
                },
                AuditVariant {
                    number: 2,
                    final_prompt: "a blue square".into(),
                    image_url: "https://img/2.png".into(),
                    chosen: false,
                },
            ],
        }];

        let text: Vec<String> = history_lines(&iterations).iter().map(line_text).collect();
        assert_eq!(text[0], "Iteration #1 - 2026-10-16 09:30:00");
        assert_eq!(text[1], "  Variant 1  ✅ CHOSEN");
        assert_eq!(text[2], "    Prompt: a red circle, \"bold\" & <bright>");
        assert_eq!(text[3], "    Image:  https://img/1.png");
        assert_eq!(text[4], "  Variant 2  ❌ Not chosen");
        assert_eq!(text.last().map(String::as_str), Some(""));
    }

    #[test]
    fn empty_input_renders_nothing() {
        assert!(history_lines(&[]).is_empty());
    }
}
