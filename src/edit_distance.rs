//! Levenshtein distance between sample identifiers.

/// Returns the edit distance between two identifiers, where insertion, deletion and
/// substitution each cost 1.
///
/// Identifiers are compared as opaque `char` sequences: case-sensitive and without any
/// Unicode normalization. Only two rows of the DP grid are kept, each as long as the
/// shorter identifier.
pub fn distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    // columns follow the shorter sequence
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if short.is_empty() {
        return long.len();
    }

    let width = short.len();
    let mut prev_row: Vec<usize> = (0..=width).collect();
    let mut row: Vec<usize> = vec![0; width + 1];

    for (i, &c_long) in long.iter().enumerate() {
        row[0] = i + 1;
        for (j, &c_short) in short.iter().enumerate() {
            let substitution = prev_row[j] + usize::from(c_long != c_short);
            let deletion = prev_row[j + 1] + 1;
            let insertion = row[j] + 1;
            row[j + 1] = substitution.min(deletion).min(insertion);
        }
        std::mem::swap(&mut row, &mut prev_row);
    }

    prev_row[width]
}
