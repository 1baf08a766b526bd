//! Edit-distance similarity over normalized titles.

/// Levenshtein distance counted in chars.
///
/// Keeps a single cost row sized to the shorter input, so memory is
/// O(min(|a|, |b|)) while time stays O(|a|·|b|).
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };

    if short.is_empty() {
        return long.len();
    }

    let mut row: Vec<usize> = (0..=short.len()).collect();
    for (i, lc) in long.iter().enumerate() {
        // `diagonal` holds row[j] from the previous iteration of the outer loop.
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let above = row[j + 1];
            let substitution = diagonal + usize::from(lc != sc);
            row[j + 1] = substitution.min(above + 1).min(row[j] + 1);
            diagonal = above;
        }
    }
    row[short.len()]
}

/// `(max_len - distance) / max_len`, with two empty strings scoring `1.0`.
///
/// Callers pass normalized strings; case and punctuation are not meaningful
/// here.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = edit_distance(a, b);
    (max_len - distance) as f64 / max_len as f64
}
