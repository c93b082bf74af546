//! Control-message handling: the request/response protocol with the host.
//!
//! One drain of the request queue processes every exception message but at
//! most one control (suspend/recover) message. Parse failures produce a
//! failed response; the caller decides whether the executor survives.

use log::{error, info, warn};

use crate::error::{FlowError, FlowResult, CODE_SUCCESS};
use crate::executor::FlowFuncExecutor;
use crate::msg::FlowMsg;
use crate::wire::{
    self, ClearKind, ExceptionKind, ExceptionNotify, ExecutorRequest, ExecutorResponse,
    QueueStatus, ResponseCommand, SubmodelStatus,
};

impl FlowFuncExecutor {
    /// Drains the request queue. On error the failed command is returned so
    /// the caller can emit the matching failure response.
    pub(crate) fn process_request_message_queue(
        &self,
    ) -> Result<(), (ResponseCommand, FlowError)> {
        let Some(request_queue) = self.request_queue() else {
            return Ok(());
        };
        let mut ctrl_msg_processed = false;
        loop {
            let msg = match request_queue.dequeue() {
                Ok(msg) => msg,
                Err(FlowError::QueueEmpty) => break,
                Err(e) => return Err((ResponseCommand::Unknown, e)),
            };
            let request: ExecutorRequest = wire::decode(msg.raw())
                .map_err(|e| (ResponseCommand::Unknown, e))?;
            match request {
                ExecutorRequest::Exception(notify) => {
                    self.process_exception_msg(&notify)
                        .map_err(|e| (ResponseCommand::Exception, e))?;
                    self.send_response(ResponseCommand::Exception, CODE_SUCCESS)
                        .map_err(|e| (ResponseCommand::Exception, e))?;
                }
                ExecutorRequest::ClearModel { kind } => {
                    // at most one control message per drain
                    if ctrl_msg_processed {
                        continue;
                    }
                    ctrl_msg_processed = true;
                    self.process_control_msg(kind)
                        .map_err(|e| (ResponseCommand::from(kind), e))?;
                }
                ExecutorRequest::Notify => {
                    // boot-time handshake only; outside of boot it is noise
                    warn!("ignoring notify message outside of boot");
                }
            }
        }
        Ok(())
    }

    fn process_control_msg(&self, kind: ClearKind) -> FlowResult<()> {
        match kind {
            ClearKind::Suspend => {
                self.set_abnormal(true);
                info!(
                    "executor will suspend {} processors",
                    self.processors().len()
                );
                {
                    let mut pending = self.suspend_pending().lock();
                    for p in self.processors() {
                        p.set_clear_and_suspend();
                        pending.insert(p.idx());
                    }
                }
                for p in self.processors() {
                    self.schedule_flow_func(p.idx())?;
                }
            }
            ClearKind::Recover => {
                self.set_abnormal(true);
                info!(
                    "executor will recover {} processors",
                    self.processors().len()
                );
                {
                    let mut pending = self.recover_pending().lock();
                    for p in self.processors() {
                        p.set_clear_and_recover();
                        pending.insert(p.idx());
                    }
                }
                for p in self.processors() {
                    self.schedule_flow_func(p.idx())?;
                }
            }
        }
        Ok(())
    }

    fn process_exception_msg(&self, notify: &ExceptionNotify) -> FlowResult<()> {
        info!(
            "exception {:?} trans_id={} scope={} for {} processors",
            notify.kind,
            notify.trans_id,
            notify.scope,
            self.processors().len()
        );
        match notify.kind {
            ExceptionKind::Add => {
                for p in self.processors() {
                    if !p.check_same_scope(&notify.scope) {
                        continue;
                    }
                    p.record_exception(notify);
                    self.schedule_flow_func(p.idx())?;
                }
            }
            ExceptionKind::Delete => {
                for p in self.processors() {
                    if !p.check_same_scope(&notify.scope) {
                        continue;
                    }
                    p.delete_exception(notify.trans_id);
                }
            }
        }
        Ok(())
    }

    /// Suspend ack from one processor. When the pending set empties, the
    /// registry-wide state reset runs and the single success response goes
    /// out.
    pub(crate) fn handle_suspend_finished(&self, idx: usize, code: i32) {
        if code != CODE_SUCCESS {
            error!("processor {idx} suspend finished with code {code}");
            let _ = self.send_response(ResponseCommand::Suspend, code);
            self.stop(false);
            return;
        }
        let emptied = {
            let mut pending = self.suspend_pending().lock();
            pending.remove(&idx);
            pending.is_empty()
        };
        if emptied {
            let all_reset = self
                .processors()
                .iter()
                .all(|p| p.reset_operator_state());
            if !all_reset {
                // partial reset support falls back to re-instantiating all
                info!("state reset unsupported, releasing all operator instances");
                for p in self.processors() {
                    p.release_operator();
                }
            }
            if self
                .send_response(ResponseCommand::Suspend, CODE_SUCCESS)
                .is_err()
            {
                error!("failed to send suspend response");
                self.stop(false);
            }
        }
        info!("suspend finished for processor {idx}");
    }

    pub(crate) fn handle_recover_finished(&self, idx: usize, code: i32) {
        if code != CODE_SUCCESS {
            error!("processor {idx} recover finished with code {code}");
            let _ = self.send_response(ResponseCommand::Recover, code);
            self.stop(false);
            return;
        }
        let emptied = {
            let mut pending = self.recover_pending().lock();
            pending.remove(&idx);
            pending.is_empty()
        };
        if emptied
            && self
                .send_response(ResponseCommand::Recover, CODE_SUCCESS)
                .is_err()
        {
            error!("failed to send recover response");
            self.stop(false);
        }
        self.set_abnormal(false);
        info!("recover finished for processor {idx}");
    }

    /// Emits a response; absence of a response queue downgrades to a no-op
    /// so embedded runs keep working.
    pub(crate) fn send_response(&self, command: ResponseCommand, code: i32) -> FlowResult<()> {
        let Some(response_queue) = self.response_queue() else {
            info!("no response queue configured, skipping response");
            return Ok(());
        };
        let response = ExecutorResponse::for_command(command, code);
        info!(
            "sending response code={} msg={}",
            response.status_code, response.error_message
        );
        let bytes = wire::encode(&response)?;
        response_queue
            .enqueue(FlowMsg::from_bytes(bytes).into_ref())
            .map_err(|e| {
                error!("enqueue response failed: {e}");
                FlowError::MemBufError(format!("response enqueue: {e}"))
            })
    }

    /// Builds and writes one processor's queue-status report.
    pub(crate) fn report_status(&self, idx: usize) -> FlowResult<()> {
        let p = &self.processors()[idx];
        let consume_total = p.consumed_total();
        let mut queue_statuses = Vec::new();
        for info in p.input_queue_infos() {
            let depth = match self.driver().queue_depth(info.device_id, info.queue_id) {
                Ok(d) => d as u32,
                Err(e) => {
                    warn!(
                        "query depth failed for queue {} on device {}: {e}",
                        info.queue_id, info.device_id
                    );
                    u32::MAX
                }
            };
            queue_statuses.push(QueueStatus {
                queue_depth: depth,
                input_consume_num: consume_total,
                queue_attrs: (&info).into(),
            });
        }
        let status = SubmodelStatus::ReportStatus {
            model_uuid: p.model_uuid(),
            queue_statuses,
        };
        p.write_status_output_queue(|| wire::encode(&status))
    }

    /// Forwards a recorded exception through the status output queue.
    pub(crate) fn handle_raise_exception(&self, idx: usize, trans_id: u64) -> FlowResult<()> {
        let p = &self.processors()[idx];
        let record = p.find_exception(trans_id).ok_or_else(|| {
            FlowError::ParamInvalid(format!(
                "no exception record {trans_id} on processor {idx}"
            ))
        })?;
        let status = SubmodelStatus::RaiseException(ExceptionNotify {
            kind: ExceptionKind::Add,
            trans_id: record.trans_id,
            user_context_id: record.user_context_id,
            exception_code: record.exception_code,
            scope: p.scope().to_string(),
            context: record.context.clone(),
        });
        info!(
            "forwarding exception trans_id={} code={} from processor {idx}",
            record.trans_id, record.exception_code
        );
        p.write_status_output_queue(|| wire::encode(&status))
    }
}
