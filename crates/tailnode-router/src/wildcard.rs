//! Certificate domain matching
//!
//! Follows the host certificate manager's convention: names compare
//! ignoring ASCII case, and a wildcard domain matches when replacing the
//! subject's labels with `*`, left to right, produces it. So `*.example.com`
//! covers `api.example.com` but neither `example.com` nor `a.b.example.com`,
//! while `*.*.example.com` covers the latter. A trailing root dot is part of
//! the name.

/// Whether a certificate for `domain` can serve `server_name`.
pub fn match_domain(server_name: &str, domain: &str) -> bool {
    if server_name.is_empty() || domain.is_empty() {
        return false;
    }
    let subject = server_name.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    if subject == domain {
        return true;
    }
    if !domain.contains('*') {
        return false;
    }

    let mut labels: Vec<&str> = subject.split('.').collect();
    for i in 0..labels.len() {
        // Empty labels are never replaced
        if labels[i].is_empty() {
            continue;
        }
        labels[i] = "*";
        if labels.join(".") == domain {
            return true;
        }
    }
    false
}
