use dubline_proto::protocol::Line;

/// Pick the line to show at `t`.
///
/// The line containing `t` wins.  Inside a gap, the nearest upcoming line
/// starting within `lookahead` seconds is shown early so short gaps do not
/// flicker.
pub fn select_line(lines: &[Line], t: f64, lookahead: f64) -> Option<&Line> {
    if let Some(line) = lines.iter().find(|l| l.contains(t)) {
        return Some(line);
    }

    lines
        .iter()
        .filter(|l| {
            let gap = l.start - t;
            gap > 0.0 && gap <= lookahead
        })
        .min_by(|a, b| a.start.total_cmp(&b.start))
}

/// Caption text for `t`; empty when nothing applies.
pub fn caption_at(lines: &[Line], t: f64, lookahead: f64) -> String {
    select_line(lines, t, lookahead)
        .map(|l| l.text.clone())
        .unwrap_or_default()
}
