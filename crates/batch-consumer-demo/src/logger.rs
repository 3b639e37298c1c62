// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event formatter for the demo's log output.
//!
//! Each line carries the time since the demo started, so batch close
//! timings can be read straight off the log. A span whose fields repeat its
//! parent's (the per-message `dispatch` and `collect` spans both carry
//! `message_id`) is printed by name only.
//!
//! ```text
//! BATCH | LEVEL | +ELAPSED | [span{fields}: ...] message fields
//! BATCH | DEBUG | +0.412s | dispatch{message_id="reading-4"}: collect: Batch closed batch_id=1 length=5 reason=count_reached
//! ```

use std::fmt;
use std::time::Instant;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    started: Instant,
}

impl Formatter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            &mut writer,
            "BATCH | {} | +{:.3}s | ",
            event.metadata().level(),
            self.started.elapsed().as_secs_f64()
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut parent_fields = String::new();
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() && fields.fields != parent_fields {
                        write!(writer, "{{{fields}}}")?;
                    }
                    parent_fields.clone_from(&fields.fields);
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
