//! Call/result token validation and its diagnostic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry};

use strand_async::queue::{AsyncQueue, DispatchMode};
use strand_async::{AsyncBlock, AsyncError, AsyncProvider, AsyncResult};

const TOKEN_A: usize = 0xA;
const TOKEN_B: usize = 0xB;
const PAYLOAD: [u8; 4] = [9, 8, 7, 6];

struct PayloadProvider;

impl AsyncProvider for PayloadProvider {
    fn do_work(&self, block: &AsyncBlock) -> AsyncResult {
        block.complete(Ok(()), PAYLOAD.len());
        Ok(())
    }

    fn get_result(&self, buffer: &mut [u8]) -> AsyncResult<usize> {
        buffer[..PAYLOAD.len()].copy_from_slice(&PAYLOAD);
        Ok(PAYLOAD.len())
    }
}

#[derive(Clone, Default)]
struct RecordingLayer {
    events: Arc<StdMutex<Vec<HashMap<String, String>>>>,
}

struct FieldVisitor<'a> {
    fields: &'a mut HashMap<String, String>,
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S> Layer<S> for RecordingLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor {
            fields: &mut fields,
        });
        self.events.lock().unwrap().push(fields);
    }
}

#[test]
fn mismatched_token_is_rejected_and_diagnosed() {
    let events = Arc::new(StdMutex::new(Vec::new()));
    let subscriber = Registry::default().with(RecordingLayer {
        events: Arc::clone(&events),
    });

    tracing::subscriber::with_default(subscriber, || {
        let queue = AsyncQueue::new(DispatchMode::Immediate, DispatchMode::Immediate);
        let block = AsyncBlock::builder().queue(queue).build();
        block
            .begin(Arc::new(PayloadProvider), TOKEN_A, "fetch_payload_async")
            .unwrap();
        block.schedule(Duration::ZERO).unwrap();
        assert_eq!(block.status(true), Ok(()));

        let mut buffer = [0u8; 4];
        assert_eq!(
            block.result(TOKEN_B, &mut buffer),
            Err(AsyncError::InvalidArg)
        );

        // The state survived the mismatch; the right token still collects.
        assert_eq!(block.result(TOKEN_A, &mut buffer), Ok(4));
        assert_eq!(buffer, PAYLOAD);
    });

    let events = events.lock().unwrap();
    let diagnosed = events.iter().any(|fields| {
        fields
            .values()
            .any(|value| value.contains("fetch_payload_async"))
    });
    assert!(
        diagnosed,
        "no diagnostic mentioned the recording function: {events:?}"
    );
}
