use owo_colors::Rgb;

/// Dim foreground for punctuation and connective text.
pub const FG1: Rgb = Rgb(128, 128, 128);

/// Bright foreground for the values worth reading.
pub const FG2: Rgb = Rgb(222, 214, 196);
