mod orchestrator;
mod rotation;
