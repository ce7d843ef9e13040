//! Static catalog of canonical Bible book codes and expansion of book selections.
//!
//! Codes are lowercase three-character USFM identifiers. Selection tokens `all`, `ot`
//! and `nt` expand to catalog order; anything else must be a known code.

use std::fmt;
use thiserror::Error;

/// Old or New Testament.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Testament {
    Old,
    New,
}

/// Static metadata for one book.
#[derive(Debug, PartialEq, Eq)]
pub struct BookInfo {
    pub code: &'static str,
    pub title: &'static str,
    pub testament: Testament,
    /// Used to scale per-book timeouts.
    pub verse_count: u32,
    /// USFM book number (OT 1-39, NT 41-67).
    pub number: u32,
}

const fn book(
    code: &'static str,
    title: &'static str,
    testament: Testament,
    verse_count: u32,
    number: u32,
) -> BookInfo {
    BookInfo {
        code,
        title,
        testament,
        verse_count,
        number,
    }
}

/// Number of Old Testament books; they occupy the first slots of [BOOKS].
pub const OT_COUNT: usize = 39;
/// Number of New Testament books.
pub const NT_COUNT: usize = 27;

/// Canonical order: OT then NT.
pub static BOOKS: [BookInfo; OT_COUNT + NT_COUNT] = [
    book("gen", "Genesis", Testament::Old, 1533, 1),
    book("exo", "Exodus", Testament::Old, 1213, 2),
    book("lev", "Leviticus", Testament::Old, 859, 3),
    book("num", "Numbers", Testament::Old, 1288, 4),
    book("deu", "Deuteronomy", Testament::Old, 959, 5),
    book("jos", "Joshua", Testament::Old, 658, 6),
    book("jdg", "Judges", Testament::Old, 618, 7),
    book("rut", "Ruth", Testament::Old, 85, 8),
    book("1sa", "1 Samuel", Testament::Old, 810, 9),
    book("2sa", "2 Samuel", Testament::Old, 695, 10),
    book("1ki", "1 Kings", Testament::Old, 816, 11),
    book("2ki", "2 Kings", Testament::Old, 719, 12),
    book("1ch", "1 Chronicles", Testament::Old, 942, 13),
    book("2ch", "2 Chronicles", Testament::Old, 822, 14),
    book("ezr", "Ezra", Testament::Old, 280, 15),
    book("neh", "Nehemiah", Testament::Old, 406, 16),
    book("est", "Esther", Testament::Old, 167, 17),
    book("job", "Job", Testament::Old, 1070, 18),
    book("psa", "Psalms", Testament::Old, 2461, 19),
    book("pro", "Proverbs", Testament::Old, 915, 20),
    book("ecc", "Ecclesiastes", Testament::Old, 222, 21),
    book("sng", "Song of Songs", Testament::Old, 117, 22),
    book("isa", "Isaiah", Testament::Old, 1292, 23),
    book("jer", "Jeremiah", Testament::Old, 1364, 24),
    book("lam", "Lamentations", Testament::Old, 154, 25),
    book("ezk", "Ezekiel", Testament::Old, 1273, 26),
    book("dan", "Daniel", Testament::Old, 357, 27),
    book("hos", "Hosea", Testament::Old, 197, 28),
    book("jol", "Joel", Testament::Old, 73, 29),
    book("amo", "Amos", Testament::Old, 146, 30),
    book("oba", "Obadiah", Testament::Old, 21, 31),
    book("jon", "Jonah", Testament::Old, 48, 32),
    book("mic", "Micah", Testament::Old, 105, 33),
    book("nam", "Nahum", Testament::Old, 47, 34),
    book("hab", "Habakkuk", Testament::Old, 56, 35),
    book("zep", "Zephaniah", Testament::Old, 53, 36),
    book("hag", "Haggai", Testament::Old, 38, 37),
    book("zec", "Zechariah", Testament::Old, 211, 38),
    book("mal", "Malachi", Testament::Old, 55, 39),
    book("mat", "Matthew", Testament::New, 1071, 41),
    book("mrk", "Mark", Testament::New, 678, 42),
    book("luk", "Luke", Testament::New, 1151, 43),
    book("jhn", "John", Testament::New, 879, 44),
    book("act", "Acts", Testament::New, 1007, 45),
    book("rom", "Romans", Testament::New, 433, 46),
    book("1co", "1 Corinthians", Testament::New, 437, 47),
    book("2co", "2 Corinthians", Testament::New, 257, 48),
    book("gal", "Galatians", Testament::New, 149, 49),
    book("eph", "Ephesians", Testament::New, 155, 50),
    book("php", "Philippians", Testament::New, 104, 51),
    book("col", "Colossians", Testament::New, 95, 52),
    book("1th", "1 Thessalonians", Testament::New, 89, 53),
    book("2th", "2 Thessalonians", Testament::New, 47, 54),
    book("1ti", "1 Timothy", Testament::New, 113, 55),
    book("2ti", "2 Timothy", Testament::New, 83, 56),
    book("tit", "Titus", Testament::New, 46, 57),
    book("phm", "Philemon", Testament::New, 25, 58),
    book("heb", "Hebrews", Testament::New, 303, 59),
    book("jas", "James", Testament::New, 108, 60),
    book("1pe", "1 Peter", Testament::New, 105, 61),
    book("2pe", "2 Peter", Testament::New, 61, 62),
    book("1jn", "1 John", Testament::New, 105, 63),
    book("2jn", "2 John", Testament::New, 13, 64),
    book("3jn", "3 John", Testament::New, 15, 65),
    book("jud", "Jude", Testament::New, 25, 66),
    book("rev", "Revelation", Testament::New, 404, 67),
];

/// A validated book code. Ordered by catalog position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BookCode(u8);

impl BookCode {
    /// Parse a code case-insensitively. Returns None for anything not in the catalog.
    pub fn parse(s: &str) -> Option<BookCode> {
        let token = s.trim().to_ascii_lowercase();
        BOOKS
            .iter()
            .position(|b| b.code == token)
            .map(|i| BookCode(i as u8))
    }

    pub fn info(self) -> &'static BookInfo {
        &BOOKS[self.0 as usize]
    }

    /// Lowercase code, e.g. `gen`.
    pub fn as_str(self) -> &'static str {
        self.info().code
    }

    pub fn testament(self) -> Testament {
        self.info().testament
    }

    pub fn verse_count(self) -> u32 {
        self.info().verse_count
    }

    pub fn number(self) -> u32 {
        self.info().number
    }

    /// Every code in catalog order.
    pub fn all() -> impl Iterator<Item = BookCode> {
        (0..BOOKS.len()).map(|i| BookCode(i as u8))
    }

    pub fn old_testament() -> impl Iterator<Item = BookCode> {
        (0..OT_COUNT).map(|i| BookCode(i as u8))
    }

    pub fn new_testament() -> impl Iterator<Item = BookCode> {
        (OT_COUNT..OT_COUNT + NT_COUNT).map(|i| BookCode(i as u8))
    }
}

impl fmt::Debug for BookCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BookCode({})", self.as_str())
    }
}

/// Displays the upper-case code (`GEN`), which is how books appear in logs and file names.
impl fmt::Display for BookCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

/// Errors from expanding a book selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Unknown book code '{0}'. Run `door43-preview list-books` to see valid codes.")]
    UnknownCode(String),

    #[error("No valid books specified.")]
    Empty,
}

/// Ordered, de-duplicated list of books to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSelection(Vec<BookCode>);

impl BookSelection {
    /// Expand selection tokens. Each value may itself hold several whitespace-separated
    /// tokens. `all`, `ot` and `nt` expand in catalog order; first occurrence wins.
    pub fn resolve<S: AsRef<str>>(values: &[S]) -> Result<BookSelection, SelectionError> {
        let mut requested: Vec<BookCode> = Vec::new();
        for value in values {
            for token in value.as_ref().split_whitespace() {
                match token.to_ascii_lowercase().as_str() {
                    "all" => requested.extend(BookCode::all()),
                    "ot" => requested.extend(BookCode::old_testament()),
                    "nt" => requested.extend(BookCode::new_testament()),
                    other => {
                        let code = BookCode::parse(other)
                            .ok_or_else(|| SelectionError::UnknownCode(token.to_string()))?;
                        requested.push(code);
                    }
                }
            }
        }
        let mut deduped = Vec::with_capacity(requested.len());
        for code in requested {
            if !deduped.contains(&code) {
                deduped.push(code);
            }
        }
        if deduped.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(BookSelection(deduped))
    }

    pub fn books(&self) -> &[BookCode] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into (kept, missing) against the books a repository actually provides.
    /// Both halves keep selection order.
    pub fn partition_available(&self, available: &[BookCode]) -> (Vec<BookCode>, Vec<BookCode>) {
        self.0.iter().copied().partition(|code| available.contains(code))
    }
}

/// Per-book timeout: `base + verse_count * per_verse`, rounded up, never below `base`.
pub fn compute_book_timeout(base_secs: u64, per_verse_secs: f64, verse_count: u32) -> u64 {
    if verse_count == 0 || per_verse_secs <= 0.0 {
        return base_secs;
    }
    let derived = base_secs as f64 + verse_count as f64 * per_verse_secs;
    base_secs.max(derived.ceil() as u64)
}

/// Render the catalog grouped by testament, as printed by `list-books`.
pub fn format_book_list() -> String {
    let mut out = String::new();
    let sections: [(&str, Vec<BookCode>); 2] = [
        ("Old Testament", BookCode::old_testament().collect()),
        ("New Testament", BookCode::new_testament().collect()),
    ];
    for (heading, codes) in sections {
        out.push_str(heading);
        out.push_str(":\n");
        for code in codes {
            out.push_str(&format!("  {:<4} {}\n", code.to_string(), code.info().title));
        }
    }
    out
}
