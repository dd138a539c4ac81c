use std::sync::{Mutex, MutexGuard};

pub fn separated_by<T, F>(
    out: &mut String,
    values: impl IntoIterator<Item = T>,
    mut f: F,
    separator: &str,
) where
    F: FnMut(&mut String, T),
{
    let mut len = out.len();
    for v in values {
        if out.len() > len {
            out.push_str(separator);
        }
        len = out.len();
        f(out, v);
    }
}

/// Largest char boundary not exceeding `len`.
pub fn floor_char_boundary(value: &str, len: usize) -> usize {
    if len >= value.len() {
        return value.len();
    }
    (0..=len)
        .rev()
        .find(|i| value.is_char_boundary(*i))
        .unwrap_or_default()
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[macro_export]
macro_rules! truncate_long {
    ($query:expr) => {
        format_args!(
            "{}{}",
            &$query[..$crate::floor_char_boundary(&$query, 497)].trim_end(),
            if $query.len() > 497 { "..." } else { "" },
        )
    };
}
