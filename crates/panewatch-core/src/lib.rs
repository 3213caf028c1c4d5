pub mod ansi;
pub mod panes;
pub mod usage;

pub use ansi::{decode_ansi, plain_text, Rgb, StyledRun, TextStyle};
pub use panes::{parse_pane_batch, shell_quote, PaneBatch, PaneQuery, PaneRecord};
pub use usage::{parse_usage_report, UsageLevel, UsageReport, UsageWindow, WorkerUsage};
