//! Deferred host command list.
//!
//! Host GPU calls made during a guest submission are buffered as a tagged
//! command stream and replayed in order onto a real host command list when
//! the submission closes. Records hold plain handles only, never references
//! to storage that could be reclaimed before replay.

use xenos_hal::{CommandList, HalError, HostCommand, PipelineHandle};

use crate::pipeline_cache::GuestPipeline;

/// One deferred record: either a direct host call, or a guest pipeline bind
/// that is resolved to a concrete host pipeline at replay time (creation may
/// still be in flight when the record is written).
#[derive(Clone, PartialEq, Debug)]
pub enum DeferredCommand {
    Host(HostCommand),
    SetPipelineHandle(GuestPipeline),
}

#[derive(Default)]
pub struct DeferredCommandList {
    commands: Vec<DeferredCommand>,
}

impl DeferredCommandList {
    pub fn new() -> DeferredCommandList {
        DeferredCommandList {
            commands: Vec::with_capacity(4096),
        }
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn push(&mut self, command: HostCommand) {
        self.commands.push(DeferredCommand::Host(command));
    }

    /// Binds a pipeline by its deferred-creation handle.
    pub fn set_pipeline_handle(&mut self, pipeline: GuestPipeline) {
        self.commands
            .push(DeferredCommand::SetPipelineHandle(pipeline));
    }

    pub fn commands(&self) -> &[DeferredCommand] {
        &self.commands
    }

    /// Replays every record in order. `resolve_pipeline` maps a guest
    /// pipeline handle to its host pipeline, or `None` while creation is
    /// pending or has failed; draws and dispatches recorded under an
    /// unresolved pipeline are skipped.
    pub fn replay(
        &self,
        list: &mut dyn CommandList,
        resolve_pipeline: &dyn Fn(GuestPipeline) -> Option<PipelineHandle>,
    ) -> Result<(), HalError> {
        let mut pipeline_bound = false;
        for command in &self.commands {
            match command {
                DeferredCommand::Host(host) => {
                    match host {
                        HostCommand::SetPipeline { .. } => {
                            pipeline_bound = true;
                        }
                        HostCommand::Dispatch { .. }
                        | HostCommand::DrawIndexedInstanced { .. }
                        | HostCommand::DrawInstanced { .. } => {
                            if !pipeline_bound {
                                continue;
                            }
                        }
                        _ => {}
                    }
                    list.execute(host)?;
                }
                DeferredCommand::SetPipelineHandle(handle) => {
                    match resolve_pipeline(*handle) {
                        Some(pipeline) => {
                            pipeline_bound = true;
                            list.execute(&HostCommand::SetPipeline { pipeline })?;
                        }
                        None => {
                            // No bind is emitted; subsequent draws skip until
                            // some other pipeline is bound.
                            pipeline_bound = false;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingList {
        commands: Vec<HostCommand>,
    }

    impl CommandList for RecordingList {
        fn execute(&mut self, command: &HostCommand) -> Result<(), HalError> {
            self.commands.push(command.clone());
            Ok(())
        }

        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
            self
        }
    }

    fn draw() -> HostCommand {
        HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            instance_count: 1,
            start_vertex: 0,
            start_instance: 0,
        }
    }

    #[test]
    fn replay_preserves_record_order() {
        let mut deferred = DeferredCommandList::new();
        deferred.push(HostCommand::SetStencilRef { value: 7 });
        deferred.push(HostCommand::SetPipeline {
            pipeline: PipelineHandle(3),
        });
        deferred.push(draw());

        let mut list = RecordingList { commands: vec![] };
        deferred.replay(&mut list, &|_| None).unwrap();
        assert_eq!(
            list.commands,
            vec![
                HostCommand::SetStencilRef { value: 7 },
                HostCommand::SetPipeline {
                    pipeline: PipelineHandle(3)
                },
                draw(),
            ]
        );
    }

    #[test]
    fn draws_without_a_bound_pipeline_are_skipped() {
        let mut deferred = DeferredCommandList::new();
        deferred.push(draw());
        deferred.push(HostCommand::Dispatch {
            group_count_x: 1,
            group_count_y: 1,
            group_count_z: 1,
        });

        let mut list = RecordingList { commands: vec![] };
        deferred.replay(&mut list, &|_| None).unwrap();
        assert!(list.commands.is_empty());
    }

    #[test]
    fn unresolved_pipeline_handle_skips_following_draws_only() {
        let mut deferred = DeferredCommandList::new();
        deferred.push(HostCommand::SetPipeline {
            pipeline: PipelineHandle(1),
        });
        deferred.push(draw());
        deferred.set_pipeline_handle(GuestPipeline(42));
        deferred.push(draw());

        let mut list = RecordingList { commands: vec![] };
        deferred.replay(&mut list, &|_| None).unwrap();
        // The first draw runs under the concrete pipeline; the second is
        // dropped because handle 42 never resolved.
        assert_eq!(list.commands.len(), 2);
    }

    #[test]
    fn resolved_pipeline_handle_binds_the_concrete_pipeline() {
        let mut deferred = DeferredCommandList::new();
        deferred.set_pipeline_handle(GuestPipeline(42));
        deferred.push(draw());

        let mut list = RecordingList { commands: vec![] };
        deferred
            .replay(&mut list, &|handle| {
                assert_eq!(handle, GuestPipeline(42));
                Some(PipelineHandle(9))
            })
            .unwrap();
        assert_eq!(
            list.commands,
            vec![
                HostCommand::SetPipeline {
                    pipeline: PipelineHandle(9)
                },
                draw(),
            ]
        );
    }
}
