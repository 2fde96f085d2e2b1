use foundry_core::pipeline::LogRing;

/// Keeps the most recent log lines in memory so they can be attached to the
/// context slice of newly activated tickets.
pub(crate) struct RingLayer {
    pub ring: LogRing,
    pub capacity: usize,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            use std::fmt::Write;
            let _ = write!(self.message, "{value:?}");
            // Strip surrounding quotes added by Debug on &str
            if self.message.starts_with('"') && self.message.ends_with('"') {
                *self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "ERROR",
            tracing::Level::WARN => "WARN",
            tracing::Level::INFO => "INFO",
            tracing::Level::DEBUG | tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        event.record(&mut MessageVisitor { message: &mut message });
        if message.is_empty() {
            return;
        }

        let line = format!(
            "{} {level} {}: {message}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            event.metadata().target()
        );
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(line);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }
    }
}
