//! Translation engines, and the cached translation service the pipeline calls.
//!
//! Engines are created lazily, once per [`LanguagePair`], and shared by every
//! worker. The [`TranslationService`] layers the [`TranslationCache`] on top
//! and never fails: if the engine gives up, the reader gets the original text
//! back rather than a blank bubble.

use std::{fmt, sync::Arc};

use clap::{Args, ValueEnum};
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::OnceCell;

use crate::{
    cache::{CacheKey, TranslationCache},
    prelude::*,
    rate_limit::RateLimit,
};

pub mod echo;
pub mod openai;

/// A source and target language, using whatever codes the engine accepts
/// (`ja`, `en`, `zh-Hans`...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// A translation engine bound to a single [`LanguagePair`].
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Translate `text`. Engines may retry internally, but an `Err` here is
    /// final.
    async fn translate(&self, text: &str) -> Result<String>;
}

/// Creates a translator for a language pair.
pub type TranslatorFactory =
    Box<dyn Fn(&LanguagePair) -> Result<Arc<dyn Translator>> + Send + Sync>;

/// Lazily-populated translators, one per language pair.
pub struct TranslatorPool {
    factory: TranslatorFactory,
    translators: DashMap<LanguagePair, Arc<dyn Translator>>,
}

impl TranslatorPool {
    pub fn new(factory: TranslatorFactory) -> Self {
        Self {
            factory,
            translators: DashMap::new(),
        }
    }

    /// Get the translator for `pair`, constructing it on first use. Concurrent
    /// callers asking for the same new pair construct it exactly once.
    pub fn get(&self, pair: &LanguagePair) -> Result<Arc<dyn Translator>> {
        if let Some(translator) = self.translators.get(pair) {
            return Ok(translator.clone());
        }
        match self.translators.entry(pair.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                debug!(%pair, "Creating translator");
                let translator = (self.factory)(pair)
                    .with_context(|| format!("cannot create translator for {pair}"))?;
                entry.insert(translator.clone());
                Ok(translator)
            }
        }
    }

    /// How many translators have been constructed?
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.translators.len()
    }
}

/// Where a translation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationSource {
    /// Nothing to translate.
    Blank,
    /// Found in the cache.
    Cache,
    /// Freshly produced by the engine.
    Engine,
    /// The engine failed, so we kept the original text.
    Fallback,
}

/// The result of [`TranslationService::translate`].
#[derive(Debug, Clone)]
pub struct Translation {
    pub text: String,
    pub source: TranslationSource,
    /// The engine error, for [`TranslationSource::Fallback`].
    pub error: Option<String>,
}

/// What every caller waiting on one engine call gets back. Errors are
/// flattened to strings so that they can be shared.
type SharedOutcome = std::result::Result<(String, TranslationSource), String>;

/// Translation with caching and graceful degradation.
///
/// Concurrent misses on the same text and language pair wait for a single
/// engine call instead of each making their own.
pub struct TranslationService {
    pool: TranslatorPool,
    cache: Option<TranslationCache>,
    in_flight: DashMap<CacheKey, Arc<OnceCell<SharedOutcome>>>,
}

impl TranslationService {
    pub fn new(pool: TranslatorPool, cache: Option<TranslationCache>) -> Self {
        Self {
            pool,
            cache,
            in_flight: DashMap::new(),
        }
    }

    pub fn cache(&self) -> Option<&TranslationCache> {
        self.cache.as_ref()
    }

    /// Translate `text`, consulting the cache first. Never fails.
    #[instrument(level = "debug", skip_all, fields(%pair))]
    pub async fn translate(&self, text: &str, pair: &LanguagePair) -> Translation {
        if text.trim().is_empty() {
            return Translation {
                text: text.to_owned(),
                source: TranslationSource::Blank,
                error: None,
            };
        }

        if let Some(hit) = self.cached(text, pair) {
            return Translation {
                text: hit,
                source: TranslationSource::Cache,
                error: None,
            };
        }

        let key = CacheKey::new(text, &pair.source, &pair.target);
        let cell = self.in_flight.entry(key.clone()).or_default().clone();
        let mut leader = false;
        let outcome = cell
            .get_or_init(|| {
                leader = true;
                self.lookup_or_translate(text, pair)
            })
            .await
            .clone();
        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));

        match outcome {
            // Somebody else paid for this one.
            Ok((translated, TranslationSource::Engine)) if !leader => {
                trace!("Shared an in-flight translation");
                Translation {
                    text: translated,
                    source: TranslationSource::Cache,
                    error: None,
                }
            }
            Ok((translated, source)) => Translation {
                text: translated,
                source,
                error: None,
            },
            Err(error) => {
                warn!("Translation failed, keeping original text: {error}");
                Translation {
                    text: text.to_owned(),
                    source: TranslationSource::Fallback,
                    error: Some(error),
                }
            }
        }
    }

    fn cached(&self, text: &str, pair: &LanguagePair) -> Option<String> {
        let hit = self.cache.as_ref()?.get(text, &pair.source, &pair.target)?;
        trace!("Cache hit");
        Some(hit)
    }

    /// Run by exactly one caller per in-flight key.
    async fn lookup_or_translate(&self, text: &str, pair: &LanguagePair) -> SharedOutcome {
        // An earlier leader may have finished between our cache miss and
        // claiming the key.
        if let Some(hit) = self.cached(text, pair) {
            return Ok((hit, TranslationSource::Cache));
        }
        let result = match self.pool.get(pair) {
            Ok(translator) => translator.translate(text).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(translated) => {
                if let Some(cache) = &self.cache {
                    cache.put(text, &translated, &pair.source, &pair.target);
                }
                Ok((translated, TranslationSource::Engine))
            }
            Err(err) => Err(format!("{err:#}")),
        }
    }
}

/// Our translation engines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum TranslatorType {
    /// An OpenAI-compatible chat completion API (OpenAI, LiteLLM, Ollama...).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Return `[<target>] <text>`. For testing.
    Echo,
}

/// Translation-related options.
#[derive(Args, Clone, Debug)]
pub struct TranslatorOpts {
    /// The translation engine to use.
    #[clap(long, value_enum, default_value_t = TranslatorType::default())]
    pub translator: TranslatorType,

    /// The model to request from OpenAI-compatible APIs.
    #[clap(long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// A timeout, in seconds, for a single translation request.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for translation requests, of the form "10/s" or "2000/m".
    /// This is applied separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// The language of the source text.
    #[clap(long, default_value = "ja")]
    pub source_lang: String,

    /// The language to translate into.
    #[clap(long, default_value = "en")]
    pub target_lang: String,
}

impl TranslatorOpts {
    /// The language pair we were asked to translate.
    pub fn language_pair(&self) -> LanguagePair {
        LanguagePair::new(&self.source_lang, &self.target_lang)
    }

    /// Build a pool which creates translators of the configured type.
    pub fn create_pool(&self) -> Result<TranslatorPool> {
        let factory: TranslatorFactory = match self.translator {
            TranslatorType::Echo => Box::new(|pair: &LanguagePair| {
                Ok(Arc::new(echo::EchoTranslator::new(pair)) as Arc<dyn Translator>)
            }),
            TranslatorType::OpenAI => {
                let client = openai::create_client();
                // One limiter for the whole process, however many language
                // pairs we end up using.
                let throttle = Arc::new(crate::rate_limit::Throttle::new(
                    self.rate_limit.as_ref(),
                ));
                let model = self.model.clone();
                let timeout = self.timeout;
                Box::new(move |pair: &LanguagePair| {
                    Ok(Arc::new(openai::OpenAiTranslator::new(
                        client.clone(),
                        &model,
                        pair.clone(),
                        timeout,
                        throttle.clone(),
                    )) as Arc<dyn Translator>)
                })
            }
        };
        Ok(TranslatorPool::new(factory))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::test_support::{CountingTranslator, FailingTranslator, slow_counting_service};

    fn counting_pool(calls: Arc<AtomicUsize>, created: Arc<AtomicUsize>) -> TranslatorPool {
        TranslatorPool::new(Box::new(move |pair: &LanguagePair| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingTranslator::new(pair, calls.clone())) as Arc<dyn Translator>)
        }))
    }

    #[tokio::test]
    async fn pool_constructs_each_pair_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(counting_pool(Arc::new(AtomicUsize::new(0)), created.clone()));
        let ja_en = LanguagePair::new("ja", "en");

        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            let pair = ja_en.clone();
            handles.push(tokio::spawn(async move { pool.get(&pair).map(|_| ()) }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        pool.get(&LanguagePair::new("ko", "en")).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn cache_hits_skip_the_engine() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranslationCache::in_memory(100);
        let service = TranslationService::new(
            counting_pool(calls.clone(), Arc::new(AtomicUsize::new(0))),
            Some(cache.clone()),
        );
        let pair = LanguagePair::new("ja", "en");

        let first = service.translate("こんにちは", &pair).await;
        assert_eq!(first.source, TranslationSource::Engine);
        let second = service.translate(" こんにちは ", &pair).await;
        assert_eq!(second.source, TranslationSource::Cache);
        assert_eq!(second.text, first.text);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_engine_call() {
        let cache = TranslationCache::in_memory(100);
        let (service, calls) =
            slow_counting_service(Some(cache.clone()), Duration::from_millis(100));
        let pair = LanguagePair::new("ja", "en");

        let tasks = (0..4)
            .map(|_| {
                let service = service.clone();
                let pair = pair.clone();
                tokio::spawn(async move { service.translate("同じ", &pair).await })
            })
            .collect::<Vec<_>>();
        let mut sources = vec![];
        for task in tasks {
            let translation = task.await.unwrap();
            assert_eq!(translation.text, "<en> 同じ");
            sources.push(translation.source);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sources
                .iter()
                .filter(|source| **source == TranslationSource::Engine)
                .count(),
            1
        );
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_without_cache_still_share() {
        let (service, calls) = slow_counting_service(None, Duration::from_millis(50));
        let pair = LanguagePair::new("ja", "en");
        let (a, b) = tokio::join!(
            service.translate("同じ", &pair),
            service.translate(" 同じ ", &pair)
        );
        assert_eq!(a.text, b.text);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Nothing is left behind once the call finishes.
        assert!(service.in_flight.is_empty());
    }

    #[tokio::test]
    async fn blank_text_is_not_translated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = TranslationService::new(
            counting_pool(calls.clone(), Arc::new(AtomicUsize::new(0))),
            None,
        );
        let result = service.translate("  \n", &LanguagePair::new("ja", "en")).await;
        assert_eq!(result.source, TranslationSource::Blank);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_failure_falls_back_to_original() {
        let cache = TranslationCache::in_memory(100);
        let pool = TranslatorPool::new(Box::new(|_: &LanguagePair| {
            Ok(Arc::new(FailingTranslator) as Arc<dyn Translator>)
        }));
        let service = TranslationService::new(pool, Some(cache.clone()));
        let result = service.translate("元気?", &LanguagePair::new("ja", "en")).await;
        assert_eq!(result.source, TranslationSource::Fallback);
        assert_eq!(result.text, "元気?");
        assert!(result.error.is_some());
        // Failures are never cached.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn language_pair_display() {
        assert_eq!(LanguagePair::new("ja", "en").to_string(), "ja->en");
    }
}
