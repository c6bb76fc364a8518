mod postgres;
mod reconciler;
