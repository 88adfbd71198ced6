#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("bus: {0}")]
    Bus(#[from] herald_api::BusError),
}
