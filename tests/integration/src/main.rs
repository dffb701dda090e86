mod helpers;

mod events;
mod membership;
mod reachability;
