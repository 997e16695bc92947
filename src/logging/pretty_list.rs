use std::fmt;

/// Wrapper for &[T] which can be pretty-printed as a numbered markdown-style
/// list. Memory dumps use it to print one heap, page, or buffer per line.
pub struct PrettyList<'data, T>(pub &'data [T]);

impl<'data, T> fmt::Debug for PrettyList<'data, T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(" (none)");
        }
        f.write_str("\n")?;
        for (index, entry) in self.0.iter().enumerate() {
            if f.alternate() {
                writeln!(f, "{:>3}. {:#?}", index, entry)?;
            } else {
                writeln!(f, "{:>3}. {:?}", index, entry)?;
            }
        }
        Ok(())
    }
}

impl<'data, T> fmt::Display for PrettyList<'data, T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(" (none)");
        }
        f.write_str("\n")?;
        for (index, entry) in self.0.iter().enumerate() {
            writeln!(f, "{:>3}. {}", index, entry)?;
        }
        Ok(())
    }
}
