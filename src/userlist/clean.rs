use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Email placeholder for text rows that carry no address.
pub const NULL_EMAIL: &str = "null";

const NAME_STRIP: &[char] = &[')', '(', '!', '"', '\'', ':', '@', '#', '$', '.', ','];
const EMAIL_STRIP: &[char] = &[')', '(', '"', '\''];

/// Split a raw text row into `(name, email)`.
///
/// The first whitespace-delimited token containing `@` is taken out as the
/// email; the remaining tokens are rejoined with single spaces.
pub fn parse_line(line: &str) -> (String, String) {
    let mut words: Vec<&str> = line.split_whitespace().collect();
    let email = match words.iter().position(|word| word.contains('@')) {
        Some(index) => words.remove(index).to_string(),
        None => NULL_EMAIL.to_string(),
    };
    (words.join(" "), email)
}

/// Normalize a name for printing and comparison.
///
/// Diacritics are stripped (NFKD, combining marks dropped), the result is
/// uppercased, punctuation in `)(!"':@#$.,` is removed, hyphens become spaces
/// and whitespace runs collapse to a single space.
pub fn clean_name(name: &str) -> String {
    let folded = strip_marks(&strip_marks(name).to_uppercase());
    let stripped: String = folded
        .chars()
        .filter(|c| !NAME_STRIP.contains(c))
        .map(|c| if c == '-' { ' ' } else { c })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove parentheses and quotes from an email, then trim it.
pub fn clean_email(email: &str) -> String {
    email
        .chars()
        .filter(|c| !EMAIL_STRIP.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn strip_marks(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}
