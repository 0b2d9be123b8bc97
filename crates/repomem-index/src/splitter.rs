//! Fixed-size line windows for text without structural boundaries.

/// A run of whole lines, 1-based inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_line: usize,
    pub end_line: usize,
    pub chars: usize,
}

/// Split `text` into contiguous whole-line windows covering every line.
///
/// Windows accumulate lines up to `target` characters and exceed it only when
/// a single line does. Whitespace-only windows and a trailing window under
/// `min` characters are folded into their neighbour as long as the result
/// stays within `max`.
pub fn split_lines(text: &str, target: usize, min: usize, max: usize) -> Vec<Window> {
    let target = target.max(1);
    let mut windows: Vec<(Window, bool)> = Vec::new();
    let mut current: Option<(Window, bool)> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let len = line.chars().count() + 1;
        let blank = line.trim().is_empty();

        match current.as_mut() {
            Some((w, has_text)) if w.chars + len <= target => {
                w.end_line = line_no;
                w.chars += len;
                *has_text |= !blank;
            }
            _ => {
                if let Some(done) = current.take() {
                    windows.push(done);
                }
                current = Some((
                    Window {
                        start_line: line_no,
                        end_line: line_no,
                        chars: len,
                    },
                    !blank,
                ));
            }
        }
    }
    if let Some(done) = current {
        windows.push(done);
    }

    fold_blank(&mut windows, max);
    if windows.len() >= 2
        && let Some((last, _)) = windows.last().copied()
    {
        let prev = windows[windows.len() - 2].0;
        if last.chars < min && prev.chars + last.chars <= max {
            windows.pop();
            if let Some((p, _)) = windows.last_mut() {
                p.end_line = last.end_line;
                p.chars += last.chars;
            }
        }
    }

    windows.into_iter().map(|(w, _)| w).collect()
}

fn fold_blank(windows: &mut Vec<(Window, bool)>, max: usize) {
    let mut i = 0;
    while i < windows.len() && windows.len() > 1 {
        if windows[i].1 {
            i += 1;
            continue;
        }
        let blank = windows[i].0;
        if i > 0 && windows[i - 1].0.chars + blank.chars <= max {
            let prev = &mut windows[i - 1].0;
            prev.end_line = blank.end_line;
            prev.chars += blank.chars;
            windows.remove(i);
        } else if i + 1 < windows.len() && windows[i + 1].0.chars + blank.chars <= max {
            let next = &mut windows[i + 1].0;
            next.start_line = blank.start_line;
            next.chars += blank.chars;
            windows.remove(i);
        } else {
            i += 1;
        }
    }
}
