// Copyright © 2018 Cormac O'Brien
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Skinned-model animation state machine: frame/ilip/flip advancement,
//! frame-FX dispatch, and movement-driven rate selection.
//!
//! Grounded on `ObjectAnimation.c`'s `set_character_animation_rate` for
//! rate selection and on the frame/lip bookkeeping implied by
//! `common::mdl`'s `FrameSingle`/`FrameGroup` (the model crate this would
//! sit on top of in a full engine is out of scope here; frame metadata is
//! supplied through [`ActionSource`]).

use super::Slot;

pub const FLIP_TOLERANCE: f32 = 0.125;

/// Ticks a standing object idles before picking a bored-idle variant.
pub const BORE_TIME: i32 = 180;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionId(pub u16);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionFamily {
    /// `D*` idle/dance actions.
    Dance,
    /// `W*` locomotion actions.
    Walk,
    Other,
}

/// Static per-action metadata, supplied by whatever owns the skinned model
/// data (out of scope here).
#[derive(Clone, Debug)]
pub struct ActionDef {
    pub id: ActionId,
    pub first_frame: u32,
    pub last_frame: u32,
    pub family: ActionFamily,
    pub freeze_at_last_frame: bool,
    pub loop_animation: bool,
    pub next_action: ActionId,
}

bitflags::bitflags! {
    /// Bit flags a keyframe may carry, tested at `ilip == 3`.
    pub struct FrameFx: u32 {
        const ACTLEFT   = 0b0000_0000_0001;
        const ACTRIGHT  = 0b0000_0000_0010;
        const GRABLEFT  = 0b0000_0000_0100;
        const GRABRIGHT = 0b0000_0000_1000;
        const CHARLEFT  = 0b0000_0001_0000;
        const CHARRIGHT = 0b0000_0010_0000;
        const DROPLEFT  = 0b0000_0100_0000;
        const DROPRIGHT = 0b0000_1000_0000;
        const POOF      = 0b0001_0000_0000;
        const FOOTFALL  = 0b0010_0000_0000;
    }
}

/// A side effect fired by frame-FX dispatch; interpreted by whatever layer
/// has access to the object handler/audio/inventory systems.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    WeaponSwipe(Slot),
    AttemptGrab(Slot),
    AttemptCharacterGrab(Slot),
    Drop(Slot),
    Poof,
    Footfall,
}

fn dispatch_frame_fx(fx: FrameFx, out: &mut Vec<FrameEvent>) {
    if fx.contains(FrameFx::ACTLEFT) {
        out.push(FrameEvent::WeaponSwipe(Slot::Left));
    }
    if fx.contains(FrameFx::ACTRIGHT) {
        out.push(FrameEvent::WeaponSwipe(Slot::Right));
    }
    if fx.contains(FrameFx::GRABLEFT) {
        out.push(FrameEvent::AttemptGrab(Slot::Left));
    }
    if fx.contains(FrameFx::GRABRIGHT) {
        out.push(FrameEvent::AttemptGrab(Slot::Right));
    }
    if fx.contains(FrameFx::CHARLEFT) {
        out.push(FrameEvent::AttemptCharacterGrab(Slot::Left));
    }
    if fx.contains(FrameFx::CHARRIGHT) {
        out.push(FrameEvent::AttemptCharacterGrab(Slot::Right));
    }
    if fx.contains(FrameFx::DROPLEFT) {
        out.push(FrameEvent::Drop(Slot::Left));
    }
    if fx.contains(FrameFx::DROPRIGHT) {
        out.push(FrameEvent::Drop(Slot::Right));
    }
    if fx.contains(FrameFx::POOF) {
        out.push(FrameEvent::Poof);
    }
    if fx.contains(FrameFx::FOOTFALL) {
        out.push(FrameEvent::Footfall);
    }
}

/// Supplies the per-action/per-frame metadata the state machine needs but
/// doesn't own: model data proper is out of scope for this crate.
pub trait ActionSource {
    fn action(&self, id: ActionId) -> ActionDef;
    fn frame_fx(&self, action: ActionId, frame: u32) -> FrameFx;
    /// Remaps the locomotion action to its riding/sitting variant, for
    /// mounted objects that loop a walking action.
    fn riding_variant(&self, action: ActionId) -> ActionId {
        action
    }
    /// First frame index of the given lip within `action`, used to
    /// re-synchronize all walkers when switching locomotion actions.
    fn lip_to_frame(&self, action: ActionId, lip: u32) -> u32 {
        let _ = lip;
        self.action(action).first_frame
    }
    /// Picks a bored-idle variant when the boredom timer expires. `sample`
    /// is a uniform draw in `[0, 1)`. Default: no variety, keep whatever
    /// idle action is already playing.
    fn bored_variant(&self, current: ActionId, sample: f32) -> ActionId {
        let _ = sample;
        current
    }
}

#[derive(Copy, Clone, Debug)]
pub struct AnimationState {
    pub src: u32,
    pub tgt: u32,
    pub ilip: u8,
    pub flip: f32,
    pub rate: f32,
    pub action: ActionId,
    pub next_action: ActionId,
    pub interruptible: bool,
    /// If set, the rate selection logic leaves `rate` untouched this tick.
    pub action_keep: bool,
}

impl AnimationState {
    pub fn new() -> AnimationState {
        AnimationState {
            src: 0,
            tgt: 0,
            ilip: 0,
            flip: 0.0,
            rate: 1.0,
            action: ActionId(0),
            next_action: ActionId(0),
            interruptible: true,
            action_keep: false,
        }
    }

    pub fn start_animation(&mut self, action: ActionId, frame: u32, interruptible: bool) {
        self.action = action;
        self.src = frame;
        self.tgt = frame;
        self.ilip = 0;
        self.flip = 0.0;
        self.interruptible = interruptible;
    }

    /// Checks the `integer_flip`/`real_flip` consistency invariant from the
    /// data model: `flip ≈ ilip / 4` within [`FLIP_TOLERANCE`].
    pub fn flip_is_consistent(&self) -> bool {
        self.ilip <= 4 && (self.flip - self.ilip as f32 / 4.0).abs() <= FLIP_TOLERANCE
    }

    /// Advances the animation by one tick, firing frame-FX events collected
    /// into `events`. `is_ridden` selects the riding/sitting remap on loop.
    pub fn tick(&mut self, source: &dyn ActionSource, is_ridden: bool, events: &mut Vec<FrameEvent>) {
        let mut flip_diff = 0.25 * self.rate;
        while flip_diff >= (1.0 - self.flip).min(0.25 - (self.flip % 0.25)).max(1e-6) && self.ilip < 4 {
            let remaining = 0.25 - (self.ilip as f32 * 0.25 - (self.ilip as f32 * 0.25)).max(0.0);
            let to_next_quarter = ((self.ilip as f32 + 1.0) * 0.25) - self.flip;
            if flip_diff < to_next_quarter {
                break;
            }
            flip_diff -= to_next_quarter;
            self.flip = (self.ilip as f32 + 1.0) * 0.25;
            self.ilip += 1;
            let _ = remaining;

            if self.ilip == 3 {
                let fx = source.frame_fx(self.action, self.tgt);
                dispatch_frame_fx(fx, events);
            }

            if self.ilip == 4 {
                self.advance_frame(source, is_ridden);
                self.ilip = 0;
                self.flip = 0.0;
            }
        }
        self.flip += flip_diff;
    }

    fn advance_frame(&mut self, source: &dyn ActionSource, is_ridden: bool) {
        self.src = self.tgt;
        self.tgt += 1;
        let action_def = source.action(self.action);

        if self.tgt <= action_def.last_frame {
            return;
        }

        if action_def.freeze_at_last_frame {
            self.tgt = action_def.last_frame;
            self.src = action_def.last_frame;
            self.interruptible = true;
        } else if action_def.loop_animation {
            if is_ridden {
                self.action = source.riding_variant(self.action);
                let def = source.action(self.action);
                self.src = def.first_frame;
                self.tgt = def.first_frame;
            } else {
                self.src = action_def.first_frame;
                self.tgt = action_def.first_frame;
            }
        } else {
            let next = action_def.next_action;
            let next_def = source.action(next);
            self.action = next;
            self.src = next_def.first_frame;
            self.tgt = next_def.first_frame;
            self.interruptible = matches!(next_def.family, ActionFamily::Walk | ActionFamily::Dance);
        }
    }
}

impl Default for AnimationState {
    fn default() -> AnimationState {
        AnimationState::new()
    }
}

/// Inputs to rate selection that come from the owning object, kept
/// separate from `AnimationState` so the state machine itself stays
/// free of object-level concerns.
pub struct RateSelectionInput {
    pub is_attacking: bool,
    pub mount_rate: Option<f32>,
    pub mount_is_scenery: bool,
    pub is_grounded: bool,
    pub is_flying: bool,
    pub is_stealthed: bool,
    pub is_slippy: bool,
    pub scale: f32,
    pub actual_horizontal_speed: f32,
    pub desired_horizontal_speed: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocomotionAction {
    Stand,
    Sneak,
    Walk,
    Run,
}

/// Selects a new animation rate (and, for locomotion actions, a new
/// action) from the object's current motion. Mirrors
/// `set_character_animation_rate`.
///
/// Returns `Some(action)` when the locomotion action should switch.
///
/// `bore_timer` is the owning object's boredom countdown; `bore_sample` is a
/// uniform draw in `[0, 1)` used to pick a bored-idle variant on expiry.
pub fn select_rate(state: &mut AnimationState, input: &RateSelectionInput, source: &dyn ActionSource, bore_timer: &mut i32, bore_sample: f32) -> Option<ActionId> {
    if input.mount_rate.is_some() || input.is_attacking {
        if let Some(rate) = input.mount_rate {
            state.rate = if input.mount_is_scenery { 0.0 } else { rate };
        }
        return None;
    }
    if state.action_keep {
        state.rate = 1.0;
        return None;
    }

    let action_def = source.action(state.action);
    let is_walk_type = matches!(action_def.family, ActionFamily::Dance | ActionFamily::Walk);
    if !is_walk_type {
        state.rate = 1.0;
        return None;
    }

    if !state.interruptible {
        if state.rate == 0.0 {
            state.rate = 1.0;
        }
        return None;
    }

    state.rate = 1.0;
    if !input.is_grounded && !input.is_flying {
        return None;
    }

    let mut speed = if input.is_flying {
        input.actual_horizontal_speed
    } else {
        input.actual_horizontal_speed.max(input.desired_horizontal_speed)
    };
    if input.is_slippy && !input.is_flying {
        state.rate = 2.0;
        speed *= 2.0;
    }
    if input.scale > 0.0 {
        speed /= input.scale;
    }

    let mut locomotion = if speed <= 1.0 {
        LocomotionAction::Stand
    } else if input.is_stealthed {
        LocomotionAction::Sneak
    } else if speed <= 4.0 {
        LocomotionAction::Walk
    } else {
        LocomotionAction::Run
    };

    if input.is_flying {
        locomotion = match locomotion {
            LocomotionAction::Stand => LocomotionAction::Run,
            LocomotionAction::Sneak => LocomotionAction::Walk,
            LocomotionAction::Walk => LocomotionAction::Sneak,
            LocomotionAction::Run => LocomotionAction::Stand,
        };
    }

    state.rate = crate::math::clamp(state.rate, 0.1, 3.0);

    match locomotion {
        LocomotionAction::Stand => {
            if *bore_timer > 0 {
                *bore_timer -= 1;
                None
            } else {
                *bore_timer = BORE_TIME;
                if input.is_stealthed {
                    None
                } else {
                    state.action = source.bored_variant(state.action, bore_sample);
                    Some(state.action)
                }
            }
        }
        _ => Some(state.action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        last_frame: u32,
    }

    impl ActionSource for FixedSource {
        fn action(&self, id: ActionId) -> ActionDef {
            ActionDef {
                id,
                first_frame: 0,
                last_frame: self.last_frame,
                family: ActionFamily::Walk,
                freeze_at_last_frame: false,
                loop_animation: true,
                next_action: id,
            }
        }

        fn frame_fx(&self, _action: ActionId, frame: u32) -> FrameFx {
            if frame == 2 {
                FrameFx::FOOTFALL
            } else {
                FrameFx::empty()
            }
        }
    }

    #[test]
    fn flip_tracks_ilip_within_tolerance() {
        let mut state = AnimationState::new();
        let source = FixedSource { last_frame: 10 };
        let mut events = Vec::new();
        for _ in 0..4 {
            state.tick(&source, false, &mut events);
            assert!(state.flip_is_consistent());
        }
    }

    #[test]
    fn looping_action_wraps_to_first_frame() {
        let mut state = AnimationState::new();
        state.start_animation(ActionId(1), 0, true);
        let source = FixedSource { last_frame: 0 };
        let mut events = Vec::new();
        for _ in 0..4 {
            state.tick(&source, false, &mut events);
        }
        assert_eq!(state.src, 0);
        assert_eq!(state.tgt, 0);
    }

    #[test]
    fn footfall_fires_at_ilip_three() {
        let mut state = AnimationState::new();
        state.start_animation(ActionId(1), 1, true);
        let source = FixedSource { last_frame: 10 };
        let mut events = Vec::new();
        for _ in 0..4 {
            state.tick(&source, false, &mut events);
        }
        assert!(events.contains(&FrameEvent::Footfall));
    }

    struct BoredSource;
    impl ActionSource for BoredSource {
        fn action(&self, id: ActionId) -> ActionDef {
            ActionDef {
                id,
                first_frame: 0,
                last_frame: 10,
                family: ActionFamily::Dance,
                freeze_at_last_frame: false,
                loop_animation: true,
                next_action: id,
            }
        }
        fn frame_fx(&self, _action: ActionId, _frame: u32) -> FrameFx {
            FrameFx::empty()
        }
        fn bored_variant(&self, _current: ActionId, _sample: f32) -> ActionId {
            ActionId(99)
        }
    }

    fn standing_input() -> RateSelectionInput {
        RateSelectionInput {
            is_attacking: false,
            mount_rate: None,
            mount_is_scenery: false,
            is_grounded: true,
            is_flying: false,
            is_stealthed: false,
            is_slippy: false,
            scale: 1.0,
            actual_horizontal_speed: 0.0,
            desired_horizontal_speed: 0.0,
        }
    }

    #[test]
    fn standing_ticks_down_the_boredom_timer_without_switching() {
        let mut state = AnimationState::new();
        let source = BoredSource;
        let input = standing_input();
        let mut bore_timer = BORE_TIME;
        assert_eq!(select_rate(&mut state, &input, &source, &mut bore_timer, 0.0), None);
        assert_eq!(bore_timer, BORE_TIME - 1);
    }

    #[test]
    fn expired_boredom_timer_picks_a_bored_variant_when_not_stealthed() {
        let mut state = AnimationState::new();
        let source = BoredSource;
        let input = standing_input();
        let mut bore_timer = 0;
        let result = select_rate(&mut state, &input, &source, &mut bore_timer, 0.5);
        assert_eq!(result, Some(ActionId(99)));
        assert_eq!(bore_timer, BORE_TIME);
    }

    #[test]
    fn expired_boredom_timer_stays_idle_while_stealthed() {
        let mut state = AnimationState::new();
        let source = BoredSource;
        let mut input = standing_input();
        input.is_stealthed = true;
        let mut bore_timer = 0;
        let result = select_rate(&mut state, &input, &source, &mut bore_timer, 0.5);
        assert_eq!(result, None);
        assert_eq!(bore_timer, BORE_TIME);
    }
}
