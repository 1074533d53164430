#[derive(Clone)]
struct AppState {
    api: Arc<EngineApi>,
}

impl AppState {
    fn new(api: EngineApi) -> Self {
        Self { api: Arc::new(api) }
    }

    fn api(&self) -> &EngineApi {
        &self.api
    }
}
