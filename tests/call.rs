//! Request/response call integration tests
//!
//! Calls run on a paused tokio clock with scripted recognizer, generator and
//! audio output, so every delay in the turn cycle is observable.

use std::time::Duration;

use tokio::time::Instant;

use ethos_voice::voice::RecognitionErrorKind;
use ethos_voice::{CallEvent, EndReason, Error, Severity, SpeakerRole, TurnPhase, start_call};

mod common;

use common::{
    FALLBACK_LINE, Reply, RequestRig, collect_until, drain, coordinator, phases, request_rig,
    wait_for_capture, wait_for_phase,
};

fn notices(events: &[CallEvent]) -> Vec<(Severity, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::Notice { notice } => Some((notice.severity, notice.message.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn greeting_blocks_the_microphone_until_spoken() {
    let RequestRig {
        setup,
        probe,
        output,
        mut events,
        ..
    } = request_rig(vec![], coordinator(Some("Hola, empecemos.")), Duration::from_secs(2));
    let started = Instant::now();
    let handle = start_call(setup).unwrap();

    let opening = wait_for_capture(&mut events).await;
    assert_eq!(phases(&opening), [TurnPhase::AiSpeaking, TurnPhase::UserTurn]);
    assert!(matches!(
        opening.iter().find(|e| matches!(e, CallEvent::PhaseChanged { .. })),
        Some(CallEvent::PhaseChanged { greeting: true, .. })
    ));
    // 2 s of greeting plus the resume delay
    assert!(started.elapsed() >= Duration::from_millis(3200));
    assert_eq!(probe.starts(), 1);
    assert_eq!(output.played(), ["Hola, empecemos."]);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, TurnPhase::UserTurn);
    assert!(!snapshot.greeting);
    assert_eq!(snapshot.transcript.len(), 1);
    assert_eq!(snapshot.transcript[0].role, SpeakerRole::Assistant);

    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn final_transcript_runs_a_full_turn() {
    let RequestRig {
        setup,
        probe,
        generator,
        output,
        mut events,
    } = request_rig(
        vec![Reply::Text("Entiendo tu posición. ¿Por qué lo ves así?".to_string())],
        coordinator(Some("Hola.")),
        Duration::from_secs(2),
    );
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    let said_at = Instant::now();
    probe.say("Prefiero no hacerlo");
    let turn = wait_for_capture(&mut events).await;

    assert_eq!(
        phases(&turn),
        [TurnPhase::AiThinking, TurnPhase::AiSpeaking, TurnPhase::UserTurn]
    );

    // Microphone stays blocked and off from the final transcript until the
    // coach finished speaking
    let mut in_ai_turn = false;
    for event in &turn {
        match event {
            CallEvent::PhaseChanged { phase, .. } => {
                in_ai_turn = phase.blocks_microphone();
            }
            CallEvent::Microphone { state } if in_ai_turn => {
                assert!(state.is_blocked_by_ai);
                assert!(!state.is_capturing);
            }
            _ => {}
        }
    }

    // think delay + speech + resume delay
    let elapsed = said_at.elapsed();
    assert!(elapsed >= Duration::from_millis(4700), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    assert_eq!(generator.requests(), [(1, "Prefiero no hacerlo".to_string())]);
    assert_eq!(output.played().len(), 2);
    assert_eq!(probe.starts(), 2);

    let session = handle.end().await.unwrap();
    let roles: Vec<_> = session.transcript.utterances().iter().map(|u| u.role).collect();
    assert_eq!(
        roles,
        [SpeakerRole::Assistant, SpeakerRole::User, SpeakerRole::Assistant]
    );
    assert_eq!(session.transcript.utterances()[1].text, "Prefiero no hacerlo");
    assert_eq!(
        session.transcript.utterances()[2].text,
        "Entiendo tu posición. ¿Por qué lo ves así?"
    );
    assert!(!session.is_active);
    assert_eq!(session.end_reason, Some(EndReason::Hangup));
    assert_eq!(session.outcome.unwrap().user_turns, 1);
}

#[tokio::test(start_paused = true)]
async fn interim_results_update_a_partial_user_utterance() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.hear_partial("Creo que");
    let seen = collect_until(&mut events, |e| {
        matches!(e, CallEvent::Transcript { utterance } if utterance.is_partial)
    })
    .await;
    let Some(CallEvent::Transcript { utterance }) = seen.last() else {
        unreachable!()
    };
    assert_eq!(utterance.text, "Creo que");
    assert_eq!(utterance.role, SpeakerRole::User);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.transcript.len(), 1);
    assert!(snapshot.transcript[0].is_partial);

    // Hanging up discards the unfinished utterance
    let session = handle.end().await.unwrap();
    assert!(session.transcript.is_empty());
}

#[tokio::test(start_paused = true)]
async fn provider_failure_speaks_a_fallback_line() {
    let RequestRig {
        setup,
        probe,
        output,
        mut events,
        ..
    } = request_rig(vec![Reply::Fail], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.say("No estoy seguro de qué haría");
    let turn = wait_for_capture(&mut events).await;

    assert_eq!(
        phases(&turn),
        [TurnPhase::AiThinking, TurnPhase::AiSpeaking, TurnPhase::UserTurn]
    );
    assert_eq!(output.played(), [FALLBACK_LINE]);
    assert!(notices(&turn).iter().any(|(severity, _)| *severity == Severity::Warning));

    let session = handle.end().await.unwrap();
    let last = session.transcript.last_from(SpeakerRole::Assistant).unwrap();
    assert_eq!(last.text, FALLBACK_LINE);
    assert_eq!(session.outcome.unwrap().fallback_replies, 1);
}

#[tokio::test(start_paused = true)]
async fn silent_provider_falls_back_after_response_timeout() {
    let RequestRig {
        setup,
        probe,
        output,
        mut events,
        ..
    } = request_rig(vec![Reply::Hang], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    let said_at = Instant::now();
    probe.say("Lo hablaría con mi jefa");
    wait_for_phase(&mut events, TurnPhase::AiSpeaking).await;

    // think delay + response timeout
    assert!(said_at.elapsed() >= Duration::from_millis(21_500));
    assert!(said_at.elapsed() < Duration::from_secs(22));
    wait_for_phase(&mut events, TurnPhase::UserTurn).await;
    assert_eq!(output.played(), [FALLBACK_LINE]);

    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_network_errors_suspend_auto_restart() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;
    assert_eq!(probe.starts(), 1);

    for failure in 1..=5 {
        probe.fail(RecognitionErrorKind::Network);
        if failure < 5 {
            probe.wait_for_starts(failure + 1).await;
        }
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(probe.starts(), 5);
    assert!(!probe.is_running());

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.microphone.is_capturing);
    assert!(snapshot.microphone_suspended);
    assert_eq!(snapshot.phase, TurnPhase::UserTurn);

    drain(&mut events);
    handle.restart_microphone().unwrap();
    wait_for_capture(&mut events).await;
    assert_eq!(probe.starts(), 6);

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.microphone_suspended);
    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn network_errors_stop_an_engine_that_keeps_listening() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.report_error(RecognitionErrorKind::Network);
    collect_until(&mut events, |e| {
        matches!(e, CallEvent::Microphone { state } if !state.is_capturing)
    })
    .await;
    assert!(!probe.is_running());
    assert_eq!(probe.stops(), 1);

    // Backoff restart
    let stopped_at = Instant::now();
    wait_for_capture(&mut events).await;
    assert!(stopped_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(probe.starts(), 2);

    for _ in 0..5 {
        probe.report_error(RecognitionErrorKind::Network);
    }
    tokio::time::sleep(Duration::from_secs(60)).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.microphone_suspended);
    assert!(!snapshot.microphone.is_capturing);
    assert!(!probe.is_running());
    assert_eq!(probe.starts(), 2);
    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn time_limit_while_speaking_ends_the_call() {
    let config = ethos_voice::CoordinatorConfig {
        call_limit: Duration::from_secs(5),
        ..coordinator(Some("Bienvenida a la práctica de hoy."))
    };
    let RequestRig {
        setup,
        probe,
        output,
        mut events,
        ..
    } = request_rig(vec![], config, Duration::from_secs(30));
    let handle = start_call(setup).unwrap();

    let seen = collect_until(&mut events, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert_eq!(phases(&seen), [TurnPhase::AiSpeaking, TurnPhase::Ended]);
    let Some(CallEvent::Ended { reason, .. }) = seen.last() else {
        unreachable!()
    };
    assert_eq!(*reason, EndReason::TimeLimit);

    let session = handle.wait().await.unwrap();
    assert_eq!(session.end_reason, Some(EndReason::TimeLimit));
    assert!(!session.is_active);
    assert!(session.ended_at.is_some());

    // Playback notices the stop on its next poll
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(output.interrupted(), 1);
    assert_eq!(output.completed(), 0);
    assert_eq!(probe.releases(), 1);
    assert!(!probe.is_running());
}

#[tokio::test(start_paused = true)]
async fn hanging_up_while_thinking_drops_the_late_reply() {
    let RequestRig {
        setup,
        probe,
        generator,
        output,
        mut events,
    } = request_rig(
        vec![Reply::Delayed(Duration::from_secs(3), "Demasiado tarde".to_string())],
        coordinator(None),
        Duration::from_secs(1),
    );
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.say("Lo denunciaría");
    wait_for_phase(&mut events, TurnPhase::AiThinking).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(generator.requests().len(), 1);

    let session = handle.end().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(output.played().is_empty());
    assert!(session.transcript.last_from(SpeakerRole::Assistant).is_none());
    assert_eq!(session.transcript.len(), 1);
    assert_eq!(probe.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_ends_the_call() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.fail(RecognitionErrorKind::NotAllowed);
    let seen = collect_until(&mut events, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert!(notices(&seen).iter().any(|(severity, _)| *severity == Severity::Error));

    let session = handle.wait().await.unwrap();
    assert_eq!(session.end_reason, Some(EndReason::Fatal));
}

#[tokio::test(start_paused = true)]
async fn unsupported_platform_refuses_to_start() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(Some("Hola.")), Duration::from_secs(1));
    probe.make_unsupported("no audio input device");

    let result = start_call(setup);
    assert!(matches!(result, Err(Error::UnsupportedPlatform(_))));
    assert_eq!(probe.starts(), 0);

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event,
        CallEvent::Notice { notice } if notice.severity == Severity::Error
    ));
}

#[tokio::test(start_paused = true)]
async fn muted_user_is_not_heard() {
    let RequestRig {
        setup,
        probe,
        generator,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    handle.set_mute(true).unwrap();
    collect_until(&mut events, |e| {
        matches!(e, CallEvent::Microphone { state } if state.is_user_muted && !state.is_capturing)
    })
    .await;
    assert!(!probe.is_running());

    probe.say("Esto no debería contar");
    tokio::time::sleep(Duration::from_secs(5)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, TurnPhase::UserTurn);
    assert!(snapshot.transcript.is_empty());
    assert!(generator.requests().is_empty());
    assert_eq!(probe.starts(), 1);

    handle.set_mute(false).unwrap();
    wait_for_capture(&mut events).await;
    assert_eq!(probe.starts(), 2);
    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn short_acknowledgements_are_treated_as_echo() {
    let RequestRig {
        setup,
        probe,
        generator,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();
    wait_for_capture(&mut events).await;

    probe.say("Vale");
    probe.say("a");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, TurnPhase::UserTurn);
    assert!(snapshot.transcript.is_empty());
    assert!(generator.requests().is_empty());
    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_starts_leave_the_microphone_to_the_user() {
    let RequestRig {
        setup,
        probe,
        mut events,
        ..
    } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    probe.fail_next_starts(2);
    let handle = start_call(setup).unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, CallEvent::Notice { notice } if notice.severity == Severity::Error)
    })
    .await;
    assert_eq!(phases(&seen), [TurnPhase::UserTurn]);
    assert_eq!(probe.starts(), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.starts(), 2);
    assert!(!handle.snapshot().await.unwrap().microphone.is_capturing);

    handle.restart_microphone().unwrap();
    wait_for_capture(&mut events).await;
    assert_eq!(probe.starts(), 3);
    handle.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ended_call_rejects_commands() {
    let RequestRig { setup, .. } = request_rig(vec![], coordinator(None), Duration::from_secs(1));
    let handle = start_call(setup).unwrap();

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(handle.is_finished());
    assert!(matches!(handle.set_mute(true), Err(Error::CallEnded)));
    assert!(matches!(handle.snapshot().await, Err(Error::CallEnded)));

    let session = handle.end().await.unwrap();
    assert_eq!(session.end_reason, Some(EndReason::TimeLimit));
    assert_eq!(session.outcome.unwrap().duration_secs, 300);
}
