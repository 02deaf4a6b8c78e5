use std::sync::Arc;

use crate::config::Config;
use crate::fetch::Fetcher;
use crate::proxy::{RequestInterceptor, ResponseRecorder, Strategy};
use crate::store::repository::Repository;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<Repository>,
    pub fetcher: Arc<Fetcher>,
    pub interceptor: Arc<RequestInterceptor>,
    pub recorder: Arc<ResponseRecorder>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, repository: Arc<Repository>, fetcher: Arc<Fetcher>) -> Self {
        let strategy = if config.rfc9111 {
            Strategy::Rfc9111
        } else {
            Strategy::Ttl
        };
        let interceptor = Arc::new(RequestInterceptor::new(
            strategy,
            Arc::clone(&repository),
            &config,
        ));
        let recorder = Arc::new(ResponseRecorder::new(
            strategy,
            Arc::clone(&repository),
            &config,
        ));

        Self {
            config: Arc::new(config),
            repository,
            fetcher,
            interceptor,
            recorder,
        }
    }
}
