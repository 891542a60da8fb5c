//! Bracket chain used to skip operators nested inside brackets or quotes

/// One bracket pair plus the next pair to consult.
///
/// Braces that sit inside a linked pair (a `(` inside quotes, say) or that are
/// escaped with `\` are not counted.
#[derive(Debug, Clone)]
pub struct Bracket {
    opening: char,
    closing: char,
    link: Option<Box<Bracket>>,
}

impl Bracket {
    pub fn new(opening: char, closing: char, link: Option<Bracket>) -> Self {
        Self {
            opening,
            closing,
            link: link.map(Box::new),
        }
    }

    /// `(` `)`, then `[` `]`, then single quotes.
    pub fn expression_chain() -> Self {
        let quotes = Bracket::new('\'', '\'', None);
        let square = Bracket::new('[', ']', Some(quotes));
        Bracket::new('(', ')', Some(square))
    }

    /// Push another pair right after the head of the chain.
    pub fn add(&mut self, opening: char, closing: char) {
        let link = self.link.take().map(|link| *link);
        self.link = Some(Box::new(Bracket::new(opening, closing, link)));
    }

    fn count_braces(&self, text: &str, brace: char, ending_pos: usize) -> usize {
        let bytes = text.as_bytes();
        text.char_indices()
            .take_while(|(pos, _)| *pos <= ending_pos)
            .filter(|(pos, c)| {
                *c == brace
                    && (*pos == 0
                        || (bytes[pos - 1] != b'\\'
                            && !self
                                .link
                                .as_ref()
                                .is_some_and(|link| link.is_in_bracket(text, *pos))))
            })
            .count()
    }

    /// True when offset `ending_pos` of `text` is inside an open pair of this
    /// bracket or any linked one.
    pub fn is_in_bracket(&self, text: &str, ending_pos: usize) -> bool {
        let opened = self.count_braces(text, self.opening, ending_pos);
        if opened > 0 {
            if self.opening != self.closing {
                let closed = self.count_braces(text, self.closing, ending_pos);
                if opened != closed {
                    return true;
                }
            } else if opened % 2 == 1 {
                return true;
            }
        }
        self.link
            .as_ref()
            .is_some_and(|link| link.is_in_bracket(text, ending_pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parentheses_and_squares() {
        let chain = Bracket::expression_chain();
        let text = "a[b+c]+d";
        assert!(chain.is_in_bracket(text, 3));
        assert!(!chain.is_in_bracket(text, 6));
        assert!(chain.is_in_bracket("(a+(b))", 5));
        assert!(!chain.is_in_bracket("(a+(b))", 6));
    }

    #[test]
    fn quotes_hide_braces() {
        let chain = Bracket::expression_chain();
        // the ')' inside quotes does not close the parenthesis
        let text = "f(')')+x";
        assert!(chain.is_in_bracket(text, 4));
        assert!(!chain.is_in_bracket(text, 6));
        assert!(chain.is_in_bracket("'a+b'", 2));
    }

    #[test]
    fn escaped_braces_are_ignored() {
        let chain = Bracket::expression_chain();
        assert!(!chain.is_in_bracket(r"a\(b+c", 4));
    }
}
