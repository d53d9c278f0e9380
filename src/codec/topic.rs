//! Topic name and topic filter validation and matching.

/// Checks if a topic is valid for publishing
pub fn valid_topic(topic: &str) -> bool {
    if topic.is_empty() {
        return false;
    }

    // topic names must not contain wildcards
    !topic.contains('+') && !topic.contains('#')
}

/// Checks if a filter is valid for subscribing
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let hirerarchy = filter.split('/').collect::<Vec<&str>>();
    if let Some((last, remaining)) = hirerarchy.split_last() {
        // # is only allowed as the final segment. a/#/b is invalid
        for entry in remaining.iter() {
            if entry.contains('#') {
                return false;
            }

            // + must occupy an entire segment. a/b+/c is invalid
            if entry.len() > 1 && entry.contains('+') {
                return false;
            }
        }

        if last.len() > 1 && (last.contains('#') || last.contains('+')) {
            return false;
        }
    }

    true
}

/// Checks if a topic matches a filter. `topic` and `filter` are assumed to
/// be valid.
///
/// `+` matches exactly one segment, `#` matches zero or more trailing
/// segments. A filter whose first segment is a wildcard never matches a
/// topic whose first segment starts with `$`.
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.is_empty() || filter.is_empty() {
        return false;
    }

    // broker internal topics stay invisible to wildcard-first filters
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topics = topic.split('/');
    let mut filters = filter.split('/');

    for f in filters.by_ref() {
        // "#" being the last element is validated by the broker with 'valid_filter'
        if f == "#" {
            return true;
        }

        // filter still has remaining elements
        // filter = a/b/c/# should match topci = a/b/c
        // filter = a/b/c/d should not match topic = a/b/c
        let top = topics.next();
        match top {
            Some(t) if t == "#" => return false,
            Some(_) if f == "+" => continue,
            Some(t) if f != t => return false,
            Some(_) => continue,
            None => return false,
        }
    }

    // topic has remaining elements and filter's last element isn't "#"
    if topics.next().is_some() {
        return false;
    }

    true
}
