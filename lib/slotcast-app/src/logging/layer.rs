use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new()
            .event_format(PipeFormatter)
            .with_writer(writer)
            .boxed()
    }
}

/// Formats events as pipe-separated sections.
///
/// ```text
/// 2024-01-01T00:00:00.000Z | DEBUG | slotcast_dispatch::sender | sender_id:"gains",num_slots:8 | Resized slot sender.
/// ```
struct PipeFormatter;

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata.level(),
            metadata.target()
        )?;

        let mut v = PipeFieldVisitor::new(writer.by_ref());
        event.record(&mut v);
        v.finish()?;

        writeln!(writer)
    }
}

/// Field visitor writing structured fields as `key:value` pairs, followed by the message.
///
/// The first write error is kept and returned when the visitor is finished, and every write after it is skipped.
struct PipeFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    last_result: fmt::Result,
}

impl<'writer> PipeFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            last_result: Ok(()),
        }
    }

    fn try_write(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.last_result.is_err() {
            return;
        }

        if field.name() == "message" {
            // The message always comes last.
            self.last_result = f(&mut self.message);
            return;
        }

        let separator = if self.fields_written == 0 { " | " } else { "," };
        self.last_result = write!(self.writer, "{}{}:", separator, field.name());
        if self.last_result.is_ok() {
            self.last_result = f(&mut self.writer);
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PipeFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.try_write(field, |w| write!(w, "{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                w.write_str(value)
            } else {
                write!(w, "\"{}\"", value)
            }
        });
    }
}

impl VisitOutput<fmt::Result> for PipeFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.last_result?;

        if self.message.is_empty() {
            Ok(())
        } else {
            write!(self.writer, " | {}", self.message)
        }
    }
}
