//! SGR-aware escape decoding for captured pane and shell output.
//!
//! Only foreground color and bold are carried. Everything else that looks like
//! an escape sequence is removed from the text and leaves the style untouched.

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    const fn gray(level: u8) -> Self {
        Self::new(level, level, level)
    }
}

/// Palette for codes 30-37 and 256-color indices 0-7.
pub const STANDARD_COLORS: [Rgb; 8] = [
    Rgb::new(0x00, 0x00, 0x00),
    Rgb::new(0xCC, 0x44, 0x44),
    Rgb::new(0x66, 0xBB, 0x6A),
    Rgb::new(0xFF, 0xEB, 0x3B),
    Rgb::new(0x42, 0xA5, 0xF5),
    Rgb::new(0xAB, 0x47, 0xBC),
    Rgb::new(0x26, 0xC6, 0xDA),
    Rgb::new(0xE0, 0xE0, 0xE0),
];

/// Palette for codes 90-97 and 256-color indices 8-15.
pub const BRIGHT_COLORS: [Rgb; 8] = [
    Rgb::new(0x75, 0x75, 0x75),
    Rgb::new(0xFF, 0x52, 0x52),
    Rgb::new(0x69, 0xF0, 0xAE),
    Rgb::new(0xFF, 0xD7, 0x40),
    Rgb::new(0x44, 0x8A, 0xFF),
    Rgb::new(0xE0, 0x40, 0xFB),
    Rgb::new(0x18, 0xFF, 0xFF),
    Rgb::new(0xFF, 0xFF, 0xFF),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextStyle {
    pub foreground: Option<Rgb>,
    pub bold: bool,
}

impl TextStyle {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    pub foreground: Option<Rgb>,
    pub bold: bool,
}

impl StyledRun {
    pub fn style(&self) -> TextStyle {
        TextStyle {
            foreground: self.foreground,
            bold: self.bold,
        }
    }

    pub fn is_plain(&self) -> bool {
        self.foreground.is_none() && !self.bold
    }
}

/// Maps a 256-color palette index to RGB.
pub fn color_256(index: u32) -> Option<Rgb> {
    match index {
        0..=7 => Some(STANDARD_COLORS[index as usize]),
        8..=15 => Some(BRIGHT_COLORS[index as usize - 8]),
        16..=231 => {
            let idx = index - 16;
            let r = (idx / 36) * 51;
            let g = ((idx % 36) / 6) * 51;
            let b = (idx % 6) * 51;
            Some(Rgb::new(r as u8, g as u8, b as u8))
        }
        232..=255 => Some(Rgb::gray((8 + (index - 232) * 10) as u8)),
        _ => None,
    }
}

/// Splits `text` into styled runs, removing every escape sequence.
///
/// Joining the returned `text` fields yields the input without escapes. A new
/// run starts only where the active style differs from the previous run, so
/// style changes that enclose no text never produce empty runs.
pub fn decode_ansi(text: &str) -> Vec<StyledRun> {
    let mut runs: Vec<StyledRun> = Vec::new();
    let mut style = TextStyle::default();
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        if ch != ESC {
            push_char(&mut runs, style, ch);
            pos += 1;
            continue;
        }

        match chars.get(pos + 1).copied() {
            // Trailing lone ESC from a truncated capture.
            None => pos += 1,
            Some('[') => match scan_csi(&chars, pos + 2) {
                Csi::Complete { params_end, final_byte } => {
                    if final_byte == 'm' {
                        let params: String = chars[pos + 2..params_end].iter().collect();
                        if is_sgr_params(&params) {
                            apply_sgr(&mut style, &params);
                        }
                    }
                    pos = params_end + 1;
                }
                Csi::Truncated => pos = chars.len(),
                Csi::Malformed => pos += 2,
            },
            Some(']') => pos = skip_osc(&chars, pos + 2),
            // Any other escape is ESC plus exactly one character.
            Some(_) => pos += 2,
        }
    }

    runs
}

/// Escape-stripped text of `text`.
pub fn plain_text(text: &str) -> String {
    decode_ansi(text).into_iter().map(|run| run.text).collect()
}

fn push_char(runs: &mut Vec<StyledRun>, style: TextStyle, ch: char) {
    if let Some(last) = runs.last_mut() {
        if last.style() == style {
            last.text.push(ch);
            return;
        }
    }
    runs.push(StyledRun {
        text: ch.to_string(),
        foreground: style.foreground,
        bold: style.bold,
    });
}

enum Csi {
    Complete { params_end: usize, final_byte: char },
    Truncated,
    Malformed,
}

// Parameter bytes 0x30-0x3F, intermediates 0x20-0x2F, final byte 0x40-0x7E.
fn scan_csi(chars: &[char], start: usize) -> Csi {
    let mut idx = start;
    while let Some(&ch) = chars.get(idx) {
        match ch {
            '\u{30}'..='\u{3f}' | '\u{20}'..='\u{2f}' => idx += 1,
            '\u{40}'..='\u{7e}' => {
                return Csi::Complete {
                    params_end: idx,
                    final_byte: ch,
                }
            }
            _ => return Csi::Malformed,
        }
    }
    Csi::Truncated
}

// OSC runs until BEL or ESC \; an unterminated OSC swallows the rest.
fn skip_osc(chars: &[char], start: usize) -> usize {
    let mut idx = start;
    while idx < chars.len() {
        match chars[idx] {
            BEL => return idx + 1,
            ESC if chars.get(idx + 1) == Some(&'\\') => return idx + 2,
            _ => idx += 1,
        }
    }
    chars.len()
}

fn is_sgr_params(params: &str) -> bool {
    params.chars().all(|ch| ch.is_ascii_digit() || ch == ';')
}

fn apply_sgr(style: &mut TextStyle, params: &str) {
    let codes: Vec<u32> = params
        .split(';')
        .filter_map(|part| part.parse::<u32>().ok())
        .collect();
    if codes.is_empty() {
        style.reset();
        return;
    }

    let mut i = 0;
    while i < codes.len() {
        match codes[i] {
            0 => style.reset(),
            1 => style.bold = true,
            2 | 22 => style.bold = false,
            code @ 30..=37 => style.foreground = Some(STANDARD_COLORS[(code - 30) as usize]),
            39 => style.foreground = None,
            code @ 90..=97 => style.foreground = Some(BRIGHT_COLORS[(code - 90) as usize]),
            38 => match codes.get(i + 1) {
                Some(5) => {
                    if let Some(&index) = codes.get(i + 2) {
                        style.foreground = color_256(index);
                        i += 2;
                    }
                }
                Some(2) => {
                    if i + 4 < codes.len() {
                        let channel = |value: u32| value.min(255) as u8;
                        style.foreground = Some(Rgb::new(
                            channel(codes[i + 2]),
                            channel(codes[i + 3]),
                            channel(codes[i + 4]),
                        ));
                        i += 4;
                    }
                }
                _ => {}
            },
            48 => match codes.get(i + 1) {
                Some(5) => i += 2,
                Some(2) => i += 4,
                _ => {}
            },
            // 40-49 and 100-107 are background; ignored like any unknown code.
            _ => {}
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = STANDARD_COLORS[1];

    fn run(text: &str, foreground: Option<Rgb>, bold: bool) -> StyledRun {
        StyledRun {
            text: text.to_string(),
            foreground,
            bold,
        }
    }

    #[test]
    fn plain_text_is_single_unstyled_run() {
        let runs = decode_ansi("hello world");
        assert_eq!(runs, vec![run("hello world", None, false)]);
    }

    #[test]
    fn empty_input_has_no_runs() {
        assert!(decode_ansi("").is_empty());
    }

    #[test]
    fn red_then_reset() {
        let runs = decode_ansi("\u{1b}[31mERROR\u{1b}[0m ok");
        assert_eq!(
            runs,
            vec![run("ERROR", Some(RED), false), run(" ok", None, false)]
        );
    }

    #[test]
    fn palette_index_21_is_pure_blue() {
        let runs = decode_ansi("\u{1b}[38;5;21mblue\u{1b}[0m");
        assert_eq!(runs, vec![run("blue", Some(Rgb::new(0, 0, 255)), false)]);
    }

    #[test]
    fn bold_and_color_in_one_sequence() {
        let runs = decode_ansi("\u{1b}[1;31mbold red\u{1b}[0m");
        assert_eq!(runs, vec![run("bold red", Some(RED), true)]);
    }

    #[test]
    fn palette_ranges() {
        assert_eq!(color_256(1), Some(STANDARD_COLORS[1]));
        assert_eq!(color_256(9), Some(BRIGHT_COLORS[1]));
        assert_eq!(color_256(16), Some(Rgb::new(0, 0, 0)));
        assert_eq!(color_256(196), Some(Rgb::new(255, 0, 0)));
        assert_eq!(color_256(231), Some(Rgb::new(255, 255, 255)));
        assert_eq!(color_256(232), Some(Rgb::new(8, 8, 8)));
        assert_eq!(color_256(255), Some(Rgb::new(238, 238, 238)));
        assert_eq!(color_256(256), None);
    }

    #[test]
    fn truecolor_channels_are_clamped() {
        let runs = decode_ansi("\u{1b}[38;2;300;128;7mx");
        assert_eq!(runs, vec![run("x", Some(Rgb::new(255, 128, 7)), false)]);
    }

    #[test]
    fn background_codes_do_not_touch_foreground() {
        let runs = decode_ansi("\u{1b}[31m\u{1b}[44;48;5;200;48;2;1;2;3;103ma\u{1b}[49mb");
        assert_eq!(runs, vec![run("ab", Some(RED), false)]);
    }

    #[test]
    fn bright_and_default_foreground() {
        let runs = decode_ansi("\u{1b}[91mhot\u{1b}[39mcold");
        assert_eq!(
            runs,
            vec![run("hot", Some(BRIGHT_COLORS[1]), false), run("cold", None, false)]
        );
    }

    #[test]
    fn dim_and_normal_intensity_clear_bold() {
        let runs = decode_ansi("\u{1b}[1ma\u{1b}[2mb\u{1b}[1mc\u{1b}[22md");
        assert_eq!(
            runs,
            vec![
                run("a", None, true),
                run("b", None, false),
                run("c", None, true),
                run("d", None, false),
            ]
        );
    }

    #[test]
    fn empty_sgr_resets_style() {
        let runs = decode_ansi("\u{1b}[1;32mgo\u{1b}[mstop");
        assert_eq!(
            runs,
            vec![run("go", Some(STANDARD_COLORS[2]), true), run("stop", None, false)]
        );
    }

    #[test]
    fn cursor_and_clear_sequences_are_stripped_without_style_change() {
        let input = "\u{1b}[33mwarn\u{1b}[2K\u{1b}[1A\u{1b}[?25l more\u{1b}7";
        let runs = decode_ansi(input);
        assert_eq!(runs, vec![run("warn more", Some(STANDARD_COLORS[3]), false)]);
    }

    #[test]
    fn unknown_sgr_codes_are_ignored() {
        let runs = decode_ansi("\u{1b}[4;31;5mx");
        assert_eq!(runs, vec![run("x", Some(RED), false)]);
    }

    #[test]
    fn same_style_is_not_split() {
        let runs = decode_ansi("\u{1b}[31ma\u{1b}[31mb\u{1b}[1A");
        assert_eq!(runs, vec![run("ab", Some(RED), false)]);
    }

    #[test]
    fn osc_title_is_stripped() {
        assert_eq!(plain_text("\u{1b}]0;title\u{07}$ ls"), "$ ls");
        assert_eq!(plain_text("\u{1b}]2;t\u{1b}\\ok"), "ok");
    }

    #[test]
    fn lone_escape_strips_a_single_character() {
        assert_eq!(plain_text("x\u{1b}7y\u{1b}8z"), "xyz");
        assert_eq!(plain_text("x\u{1b}(By"), "xBy");
    }

    #[test]
    fn truncated_sequences_are_dropped() {
        assert_eq!(plain_text("done\u{1b}[3"), "done");
        assert_eq!(plain_text("done\u{1b}"), "done");
    }

    #[test]
    fn concatenation_matches_stripped_text() {
        let input = "a\u{1b}[1mb\u{1b}[38;5;82mc\u{1b}[0md\u{1b}[Ke\u{1b}7f\nline2 \u{1b}[97m日本\u{1b}[0m";
        let joined: String = decode_ansi(input).into_iter().map(|run| run.text).collect();
        assert_eq!(joined, "abcdef\nline2 日本");
    }
}
