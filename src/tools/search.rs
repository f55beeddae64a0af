//! Web 工具：search（DuckDuckGo HTML）与 web_read（抓取页面并提取正文）
//!
//! GET 请求带超时与浏览器 User-Agent；HTML 响应用 html2text 提取可读文本，失败时回退到简易去标签。
//! 工作区执行器只依赖 WebTools trait，测试中可替换为离线实现。

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use scraper::{Html, Selector};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/?q=";

/// 使用现代浏览器 UA 与常用请求头，避免被站点识别为爬虫
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

static RESULT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result").expect("Invalid result selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result__a").expect("Invalid link selector"));
static SNIPPET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result__snippet").expect("Invalid snippet selector"));

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// search / web_read 的窄接口
#[async_trait]
pub trait WebTools: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String>;

    /// 返回页面可读正文；无法提取时返回空字符串
    async fn read(&self, url: &str) -> Result<String, String>;
}

/// 基于 reqwest 的实现
pub struct HttpWebTools {
    client: Client,
}

impl HttpWebTools {
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .default_headers({
                use reqwest::header::{HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    ACCEPT,
                    HeaderValue::from_static(
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    ),
                );
                h.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
                h
            })
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        // 去除 BOM，避免 HTML 检测失败
        Ok(body.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(body))
    }
}

#[async_trait]
impl WebTools for HttpWebTools {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String> {
        let url = format!("{}{}", SEARCH_ENDPOINT, urlencoding::encode(query));
        tracing::info!(query = %query, "web search");
        let html = self.fetch(&url).await?;
        Ok(parse_search_results(&html, max_results))
    }

    async fn read(&self, url: &str) -> Result<String, String> {
        tracing::info!(url = %url, "web read");
        let body = self.fetch(url).await?;
        let text = if looks_like_html(&body) {
            html_to_text(&body)
        } else {
            body
        };
        Ok(text.trim().to_string())
    }
}

/// 解析 DuckDuckGo HTML 结果页
pub fn parse_search_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let mut hits = Vec::new();
    for element in document.select(&RESULT_SEL) {
        if hits.len() >= max_results {
            break;
        }
        let Some(link) = element.select(&LINK_SEL).next() else {
            continue;
        };
        let title = link.text().collect::<String>().trim().to_string();
        let url = normalize_result_url(link.value().attr("href").unwrap_or(""));
        let snippet = element
            .select(&SNIPPET_SEL)
            .next()
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default()
            .trim()
            .to_string();
        if !title.is_empty() && !url.is_empty() {
            hits.push(SearchHit {
                title,
                url,
                snippet,
            });
        }
    }
    hits
}

/// 把 `//duckduckgo.com/l/?uddg=...` 跳转链接还原为目标地址
fn normalize_result_url(raw: &str) -> String {
    let absolute = if raw.starts_with("//") {
        format!("https:{}", raw)
    } else {
        raw.to_string()
    };
    let Ok(parsed) = url::Url::parse(&absolute) else {
        return raw.to_string();
    };
    if parsed.domain() == Some("duckduckgo.com") && parsed.path().starts_with("/l/") {
        if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
            return target.into_owned();
        }
    }
    absolute
}

/// 将 HTML 转为可读文本（去除 script/style 等）
fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.to_ascii_lowercase().starts_with("<html")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<meta") || s.contains("<head")))
}
