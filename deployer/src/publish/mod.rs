pub mod engine;
pub mod source;

/// CDN paths affected by changes to site-relative `paths`.
///
/// A changed `dir/index.html` is also served as `/dir/`, so that route is
/// added alongside it.
pub fn url_paths<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut urls = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref().trim_start_matches('/');
        urls.push(format!("/{path}"));
        if path == "index.html" {
            urls.push("/".to_string());
        } else if let Some(dir) = path.strip_suffix("/index.html") {
            urls.push(format!("/{dir}/"));
        }
    }
    urls.sort();
    urls.dedup();
    urls
}
