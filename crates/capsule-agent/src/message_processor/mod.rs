// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message processor - job queue, dispatcher pool and built-in workers.

pub mod email_worker;
pub mod notification_worker;
mod processor;
pub mod smtp;
mod worker;

pub use email_worker::{EMAIL_JOB_TYPE, EmailPayload, EmailWorker, MailError, Mailer};
pub use notification_worker::{NOTIFICATION_JOB_TYPE, NotificationPayload, NotificationWorker};
pub use processor::{MessageProcessor, ProcessorConfig, ProcessorError, ProcessorStats, Result};
pub use smtp::{SmtpConfig, SmtpMailer, SmtpTls};
pub use worker::{JobError, Worker};
