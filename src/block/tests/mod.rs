mod dynamic;
