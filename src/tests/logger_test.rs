#[cfg(test)]
mod tests {
    use crate::log;
    use crate::logger::{LogLevel, Logger, MemorySink};
    use std::sync::Arc;

    #[test]
    fn test_level_parsing() {
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!(" warning ".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_filtering_and_prefix() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogLevel::Info, sink.clone()).with_prefix("master web");

        log!(logger, LogLevel::Info, "forked worker {}", 12);
        log!(logger, LogLevel::Debug, "hidden");

        assert!(sink.contains(LogLevel::Info, "[master web] forked worker 12"));
        assert!(!sink.contains(LogLevel::Debug, "hidden"));
        assert!(logger.enabled(LogLevel::Error));
        assert!(!logger.enabled(LogLevel::Trace));
    }
}
