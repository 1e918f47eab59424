use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::collector::error::{CollectError, CollectResult};

/// Browser user agent; the image endpoints answer differently (or not at
/// all) to the default reqwest identity.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Per-request timeout for search and download calls. A timed-out fetch is a
/// zero-result fetch, never a round failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A search backend behind the uniform "fetch candidates for keyword"
/// capability. Implementations write downloaded files into `dest` and return
/// how many they saved.
pub(crate) trait CandidateSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch(&self, query: &str, cap: usize, min_dim: u32, dest: &Path) -> CollectResult<usize>;
}

/// Shared blocking HTTP client for the providers.
#[derive(Clone)]
pub(crate) struct SearchClient {
    http: Client,
}

impl SearchClient {
    pub(crate) fn new() -> CollectResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollectError::Config(format!("unable to build search client: {e}")))?;
        Ok(SearchClient { http })
    }

    fn get_text(&self, url: Url) -> reqwest::Result<String> {
        self.http.get(url).send()?.error_for_status()?.text()
    }

    fn fetch_bytes(&self, url: &str) -> reqwest::Result<Vec<u8>> {
        Ok(self
            .http
            .get(url)
            .send()?
            .error_for_status()?
            .bytes()?
            .to_vec())
    }

    /// Downloads up to `cap` result URLs into `dest`. Individual download
    /// failures are logged and skipped; the keyword keeps whatever survived.
    fn download_into(&self, backend: &'static str, urls: Vec<String>, cap: usize, dest: &Path) -> usize {
        let mut saved = 0;
        for (index, url) in urls.into_iter().take(cap).enumerate() {
            match self.fetch_bytes(&url) {
                Ok(bytes) if !bytes.is_empty() => {
                    let path = dest.join(format!("{}_{:06}.{}", backend, index, extension_for(&url)));
                    match std::fs::write(&path, &bytes) {
                        Ok(()) => saved += 1,
                        Err(e) => warn!("Unable to write candidate {}: {}", path.display(), e),
                    }
                }
                Ok(_) => trace!("Empty body for {}", url),
                Err(e) => debug!("Candidate download failed ({}): {}", url, e),
            }
        }
        saved
    }
}

/// Picks a filename extension for a downloaded result. The filter stage
/// re-validates by decoding, so a wrong guess here only mislabels a temp file.
fn extension_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next() {
        Some(ext) if ext.eq_ignore_ascii_case("png") => "png",
        Some(ext) if ext.eq_ignore_ascii_case("jpeg") => "jpeg",
        _ => "jpg",
    }
}

fn source_error(backend: &'static str, keyword: &str, message: impl ToString) -> CollectError {
    CollectError::Source {
        backend,
        keyword: keyword.to_string(),
        message: message.to_string(),
    }
}

fn search_url(base: &str, params: &[(&str, &str)], backend: &'static str, keyword: &str) -> CollectResult<Url> {
    Url::parse_with_params(base, params).map_err(|e| source_error(backend, keyword, e))
}

/// Bing image search via the incremental-results endpoint. Result metadata is
/// embedded in the page as HTML-escaped JSON attributes.
pub(crate) struct BingImages {
    client: SearchClient,
    murl: Regex,
}

impl BingImages {
    pub(crate) fn new(client: SearchClient) -> Self {
        BingImages {
            client,
            // "murl" is the full-size media URL inside the escaped `m` attribute.
            murl: Regex::new(r#"murl&quot;:&quot;(https?://[^&"]+?)&quot;"#)
                .expect("hard-coded regex"),
        }
    }
}

impl CandidateSource for BingImages {
    fn name(&self) -> &'static str {
        "bing"
    }

    fn fetch(&self, query: &str, cap: usize, min_dim: u32, dest: &Path) -> CollectResult<usize> {
        let count = cap.min(150).to_string();
        let size_filter = format!("+filterui:imagesize-custom_{}_{}", min_dim, min_dim);
        let url = search_url(
            "https://www.bing.com/images/async",
            &[
                ("q", query),
                ("first", "0"),
                ("count", &count),
                ("qft", &size_filter),
            ],
            self.name(),
            query,
        )?;

        let page = self
            .client
            .get_text(url)
            .map_err(|e| source_error(self.name(), query, e))?;

        let urls: Vec<String> = self
            .murl
            .captures_iter(&page)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect();

        Ok(self.client.download_into(self.name(), urls, cap, dest))
    }
}

#[derive(Deserialize)]
struct DdgResponse {
    results: Vec<DdgResult>,
}

#[derive(Deserialize)]
struct DdgResult {
    image: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

/// DuckDuckGo image search. A throwaway token (`vqd`) must be scraped from
/// the HTML search page before the JSON endpoint answers.
pub(crate) struct DuckDuckGoImages {
    client: SearchClient,
    vqd: Regex,
}

impl DuckDuckGoImages {
    pub(crate) fn new(client: SearchClient) -> Self {
        DuckDuckGoImages {
            client,
            vqd: Regex::new(r#"vqd=['"]?([\d-]+)"#).expect("hard-coded regex"),
        }
    }
}

impl CandidateSource for DuckDuckGoImages {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    fn fetch(&self, query: &str, cap: usize, min_dim: u32, dest: &Path) -> CollectResult<usize> {
        let page_url = search_url(
            "https://duckduckgo.com/",
            &[("q", query), ("iax", "images"), ("ia", "images")],
            self.name(),
            query,
        )?;
        let page = self
            .client
            .get_text(page_url)
            .map_err(|e| source_error(self.name(), query, e))?;
        let vqd = self
            .vqd
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| source_error(self.name(), query, "no vqd token in search page"))?;

        let results_url = search_url(
            "https://duckduckgo.com/i.js",
            &[("l", "us-en"), ("o", "json"), ("q", query), ("vqd", &vqd)],
            self.name(),
            query,
        )?;
        let body = self
            .client
            .get_text(results_url)
            .map_err(|e| source_error(self.name(), query, e))?;
        let decoded: DdgResponse =
            serde_json::from_str(&body).map_err(|e| source_error(self.name(), query, e))?;

        // This backend reports dimensions up front, so the resolution floor
        // applies request-level and undersized results never hit the wire.
        let urls: Vec<String> = decoded
            .results
            .into_iter()
            .filter(|r| {
                (r.width == 0 && r.height == 0) || (r.width >= min_dim && r.height >= min_dim)
            })
            .map(|r| r.image)
            .collect();

        Ok(self.client.download_into(self.name(), urls, cap, dest))
    }
}

/// Baidu image search via its JSON result endpoint.
pub(crate) struct BaiduImages {
    client: SearchClient,
}

impl BaiduImages {
    pub(crate) fn new(client: SearchClient) -> Self {
        BaiduImages { client }
    }
}

impl CandidateSource for BaiduImages {
    fn name(&self) -> &'static str {
        "baidu"
    }

    fn fetch(&self, query: &str, cap: usize, min_dim: u32, dest: &Path) -> CollectResult<usize> {
        let rn = cap.min(60).to_string();
        let url = search_url(
            "https://image.baidu.com/search/acjson",
            &[
                ("tn", "resultjson_com"),
                ("ipn", "rj"),
                ("word", query),
                ("pn", "0"),
                ("rn", &rn),
            ],
            self.name(),
            query,
        )?;
        let body = self
            .client
            .get_text(url)
            .map_err(|e| source_error(self.name(), query, e))?;
        let decoded: Value =
            serde_json::from_str(&body).map_err(|e| source_error(self.name(), query, e))?;

        let mut urls = Vec::new();
        if let Some(items) = decoded.get("data").and_then(|d| d.as_array()) {
            for item in items {
                let width = item.get("width").and_then(|w| w.as_u64()).unwrap_or(0) as u32;
                let height = item.get("height").and_then(|h| h.as_u64()).unwrap_or(0) as u32;
                if (width != 0 || height != 0) && (width < min_dim || height < min_dim) {
                    continue;
                }
                let image_url = item
                    .get("middleURL")
                    .or_else(|| item.get("thumbURL"))
                    .and_then(|u| u.as_str());
                if let Some(image_url) = image_url {
                    urls.push(image_url.to_string());
                }
            }
        }

        Ok(self.client.download_into(self.name(), urls, cap, dest))
    }
}

/// The rotating provider set for one collection run.
///
/// Providers are selected round-robin across successive keyword submissions,
/// so no single engine is hammered and a partial outage degrades the round
/// instead of failing it.
pub(crate) struct SourceSet {
    providers: Vec<Box<dyn CandidateSource>>,
    cursor: usize,
}

impl SourceSet {
    pub(crate) fn new(providers: Vec<Box<dyn CandidateSource>>) -> Self {
        SourceSet {
            providers,
            cursor: 0,
        }
    }

    /// The default three-engine rotation sharing one HTTP client.
    pub(crate) fn with_default_backends() -> CollectResult<Self> {
        let client = SearchClient::new()?;
        Ok(SourceSet::new(vec![
            Box::new(BingImages::new(client.clone())),
            Box::new(DuckDuckGoImages::new(client.clone())),
            Box::new(BaiduImages::new(client)),
        ]))
    }

    pub(crate) fn backend_count(&self) -> usize {
        self.providers.len()
    }

    /// Fetches one round of keywords concurrently on a bounded pool.
    ///
    /// Backend assignment happens on the driving thread before any worker
    /// starts, so rotation order is deterministic regardless of completion
    /// order. Each keyword gets its own scratch subdirectory to keep
    /// concurrent downloads from colliding. Returns the total number of
    /// candidate files written this round.
    pub(crate) fn fetch_round(
        &mut self,
        keywords: &[String],
        cap: usize,
        min_dim: u32,
        temp_root: &Path,
        concurrency: usize,
    ) -> usize {
        if self.providers.is_empty() || keywords.is_empty() {
            return 0;
        }

        let mut jobs: Vec<(usize, String, String, PathBuf)> = Vec::with_capacity(keywords.len());
        for keyword in keywords {
            let provider_index = self.cursor % self.providers.len();
            self.cursor = self.cursor.wrapping_add(1);

            let dest = temp_root.join(keyword.replace(' ', "_"));
            if let Err(e) = create_dir_all(&dest) {
                warn!("Unable to create scratch dir for \"{}\": {}", keyword, e);
                continue;
            }
            let query = format!("{keyword} photo high quality");
            jobs.push((provider_index, keyword.clone(), query, dest));
        }

        let providers = &self.providers;
        let total = AtomicUsize::new(0);
        let workers = jobs.len().clamp(1, concurrency.max(1));

        match ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.scope(|scope| {
                for (provider_index, keyword, query, dest) in &jobs {
                    let total = &total;
                    scope.spawn(move |_| {
                        run_fetch(
                            providers[*provider_index].as_ref(),
                            keyword,
                            query,
                            cap,
                            min_dim,
                            dest,
                            total,
                        );
                    });
                }
            }),
            Err(e) => {
                warn!("Unable to build fetch pool ({}), fetching sequentially.", e);
                for (provider_index, keyword, query, dest) in &jobs {
                    run_fetch(
                        providers[*provider_index].as_ref(),
                        keyword,
                        query,
                        cap,
                        min_dim,
                        dest,
                        &total,
                    );
                }
            }
        }

        total.into_inner()
    }
}

fn run_fetch(
    provider: &dyn CandidateSource,
    keyword: &str,
    query: &str,
    cap: usize,
    min_dim: u32,
    dest: &Path,
    total: &AtomicUsize,
) {
    match provider.fetch(query, cap, min_dim, dest) {
        Ok(saved) => {
            debug!("\"{}\": {} candidates via {}.", keyword, saved, provider.name());
            total.fetch_add(saved, Ordering::Relaxed);
        }
        // A failed keyword is not retried this round; the next round's
        // shuffle redistributes the load instead.
        Err(e) => warn!("Fetch skipped: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Records every query it receives and writes `files_per_fetch` dummy
    /// files into the destination.
    struct RecordingSource {
        name: &'static str,
        queries: Arc<Mutex<Vec<String>>>,
        files_per_fetch: usize,
    }

    impl CandidateSource for RecordingSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fetch(&self, query: &str, _cap: usize, _min_dim: u32, dest: &Path) -> CollectResult<usize> {
            self.queries
                .lock()
                .expect("query log poisoned")
                .push(format!("{}:{}", self.name, query));
            for i in 0..self.files_per_fetch {
                std::fs::write(dest.join(format!("{i}.jpg")), b"stub")?;
            }
            Ok(self.files_per_fetch)
        }
    }

    fn recording_set(
        names: &[&'static str],
        files_per_fetch: usize,
    ) -> (SourceSet, Arc<Mutex<Vec<String>>>) {
        let queries = Arc::new(Mutex::new(Vec::new()));
        let providers: Vec<Box<dyn CandidateSource>> = names
            .iter()
            .map(|&name| {
                Box::new(RecordingSource {
                    name,
                    queries: queries.clone(),
                    files_per_fetch,
                }) as Box<dyn CandidateSource>
            })
            .collect();
        (SourceSet::new(providers), queries)
    }

    fn sorted_queries(queries: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        let mut q = queries.lock().expect("query log poisoned").clone();
        q.sort();
        q
    }

    #[test]
    fn rotates_backends_across_keyword_submissions() {
        let temp = tempdir().unwrap();
        let (mut sources, queries) = recording_set(&["a", "b", "c"], 0);
        let keywords: Vec<String> = ["k1", "k2", "k3", "k4"].iter().map(|k| k.to_string()).collect();

        sources.fetch_round(&keywords, 10, 150, temp.path(), 1);

        // With a single worker the fetches run in submission order, so the
        // rotation is visible directly; a, b, c, then a again.
        let q = queries.lock().unwrap().clone();
        assert_eq!(
            q,
            vec![
                "a:k1 photo high quality",
                "b:k2 photo high quality",
                "c:k3 photo high quality",
                "a:k4 photo high quality",
            ]
        );
    }

    #[test]
    fn rotation_continues_across_rounds() {
        let temp = tempdir().unwrap();
        let (mut sources, queries) = recording_set(&["a", "b", "c"], 0);
        let keywords: Vec<String> = ["k1", "k2"].iter().map(|k| k.to_string()).collect();

        sources.fetch_round(&keywords, 10, 150, temp.path(), 1);
        sources.fetch_round(&keywords, 10, 150, temp.path(), 1);

        let q = queries.lock().unwrap().clone();
        let backends: Vec<&str> = q.iter().map(|s| s.split(':').next().unwrap()).collect();
        assert_eq!(backends, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn keywords_get_underscore_named_subdirectories() {
        let temp = tempdir().unwrap();
        let (mut sources, _queries) = recording_set(&["a"], 2);
        let keywords = vec![String::from("cute cat photo")];

        let saved = sources.fetch_round(&keywords, 10, 150, temp.path(), 4);

        assert_eq!(saved, 2);
        let subdir = temp.path().join("cute_cat_photo");
        assert!(subdir.is_dir());
        assert_eq!(std::fs::read_dir(&subdir).unwrap().count(), 2);
    }

    #[test]
    fn concurrent_round_fetches_every_keyword() {
        let temp = tempdir().unwrap();
        let (mut sources, queries) = recording_set(&["a", "b", "c"], 1);
        let keywords: Vec<String> = (0..6).map(|i| format!("k{i}")).collect();

        let saved = sources.fetch_round(&keywords, 10, 150, temp.path(), 8);

        assert_eq!(saved, 6);
        assert_eq!(sorted_queries(&queries).len(), 6);
    }

    /// A failing backend must cost only its own keyword.
    struct FailingSource;

    impl CandidateSource for FailingSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn fetch(&self, query: &str, _cap: usize, _min_dim: u32, _dest: &Path) -> CollectResult<usize> {
            Err(source_error(self.name(), query, "simulated outage"))
        }
    }

    #[test]
    fn backend_failure_does_not_abort_the_round() {
        let temp = tempdir().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let providers: Vec<Box<dyn CandidateSource>> = vec![
            Box::new(FailingSource),
            Box::new(RecordingSource {
                name: "ok",
                queries: queries.clone(),
                files_per_fetch: 1,
            }),
        ];
        let mut sources = SourceSet::new(providers);
        let keywords: Vec<String> = ["k1", "k2"].iter().map(|k| k.to_string()).collect();

        let saved = sources.fetch_round(&keywords, 10, 150, temp.path(), 2);

        // k1 hit the failing backend, k2 the healthy one.
        assert_eq!(saved, 1);
        assert_eq!(queries.lock().unwrap().len(), 1);
    }

    #[test]
    fn extension_guessing_strips_queries_and_defaults_to_jpg() {
        assert_eq!(extension_for("https://host/a/b.png?x=1"), "png");
        assert_eq!(extension_for("https://host/a/b.JPEG"), "jpeg");
        assert_eq!(extension_for("https://host/a/b.webp"), "jpg");
        assert_eq!(extension_for("https://host/a/b"), "jpg");
    }
}
